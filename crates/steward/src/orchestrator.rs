//! Maintenance orchestrator
//!
//! Runs the steps in fixed order, isolating each one: an `Err` or a panic
//! inside a step becomes that step's `error` result and the next step runs
//! anyway. Once the disk monitor flags a critical shortage, every later step
//! that needs disk headroom is recorded as skipped instead of run.

use crate::notifier::Notifier;
use crate::report::{PersistedReport, ReportGenerator, ReportStore};
use crate::runner::{CommandExecutor, CommandRunner};
use crate::steps::{
    CertificateChecker, DatabaseOptimizer, DiskProbe, DiskSpaceMonitor, FeedUpdater,
    MaintenanceStep, RetentionCleaner, ServiceHealthChecker, StepContext, DISK_CRITICAL,
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use steward_common::{AppConfig, Clock, MaintenanceReport, Result, RunMode, StepResult};
use tracing::{error, info, warn};

/// What a full run produced
#[derive(Debug)]
pub struct RunOutcome {
    pub report: MaintenanceReport,
    /// `None` when the report could not be written
    pub persisted: Option<PersistedReport>,
    pub notified: bool,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.report.exit_code()
    }
}

pub struct Orchestrator {
    steps: Vec<Box<dyn MaintenanceStep>>,
    executor: Arc<dyn CommandExecutor>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
}

impl Orchestrator {
    /// The production pipeline: health, feeds, retention, disk, database, certificates
    pub fn standard(
        executor: Arc<dyn CommandExecutor>,
        clock: Arc<dyn Clock>,
        disk_probe: Box<dyn DiskProbe>,
        notifier: Notifier,
    ) -> Self {
        let steps: Vec<Box<dyn MaintenanceStep>> = vec![
            Box::new(ServiceHealthChecker::new()),
            Box::new(FeedUpdater::new()),
            Box::new(RetentionCleaner::new()),
            Box::new(DiskSpaceMonitor::new(disk_probe)),
            Box::new(DatabaseOptimizer::new()),
            Box::new(CertificateChecker::new()),
        ];
        Self::with_steps(steps, executor, clock, notifier)
    }

    pub fn with_steps(
        steps: Vec<Box<dyn MaintenanceStep>>,
        executor: Arc<dyn CommandExecutor>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
    ) -> Self {
        Self {
            steps,
            executor,
            clock,
            notifier,
        }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step and build the report
    ///
    /// Only an invalid configuration fails the call; it is checked before any
    /// step runs.
    pub async fn execute(&self, config: &AppConfig, mode: RunMode) -> Result<MaintenanceReport> {
        config.validate()?;

        let started = self.clock.now();
        let run_id = ReportGenerator::run_id(started);
        info!(
            run_id = %run_id,
            dry_run = mode.dry_run,
            "Starting maintenance run"
        );

        let ctx = StepContext {
            config,
            mode,
            runner: CommandRunner::new(self.executor.as_ref(), mode.dry_run),
            clock: self.clock.as_ref(),
        };

        let total = self.steps.len();
        let mut results = Vec::with_capacity(total);
        let mut disk_critical = false;

        for (idx, step) in self.steps.iter().enumerate() {
            let name = step.name();
            info!("[{}/{}] {}", idx + 1, total, name);

            let result = if disk_critical && step.needs_disk_headroom() {
                warn!(step = name, "Skipping: free space critical");
                StepResult::skipped(
                    name,
                    format!(
                        "skipped: free space critical on {}",
                        config.platform.disk_path.display()
                    ),
                    self.clock.now(),
                )
            } else {
                self.run_isolated(step.as_ref(), &ctx).await
            };

            if result.detail_flag(DISK_CRITICAL) {
                disk_critical = true;
            }
            info!(step = name, status = %result.status, "Step finished");
            results.push(result);
        }

        let report =
            ReportGenerator::render(results, &config.maintenance, &run_id, self.clock.now());
        info!(
            run_id = %report.run_id,
            status = %report.overall_status,
            "Maintenance run finished"
        );
        Ok(report)
    }

    async fn run_isolated(&self, step: &dyn MaintenanceStep, ctx: &StepContext<'_>) -> StepResult {
        let name = step.name();
        let started = self.clock.now();

        match AssertUnwindSafe(step.run(ctx)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(step = name, "Step failed: {}", e);
                StepResult::failed(name, e.to_string(), started, self.clock.now())
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else {
                    "unknown panic".to_string()
                };
                error!(step = name, "Step panicked: {}", msg);
                StepResult::failed(
                    name,
                    format!("step panicked: {}", msg),
                    started,
                    self.clock.now(),
                )
            }
        }
    }

    /// Execute, persist the report, then notify
    ///
    /// A report that cannot be written is logged and does not change the run
    /// status, same as a failed notification.
    pub async fn run(
        &self,
        config: &AppConfig,
        mode: RunMode,
        store: &ReportStore,
    ) -> Result<RunOutcome> {
        let report = self.execute(config, mode).await?;

        let persisted = match store.persist(&report).await {
            Ok(paths) => Some(paths),
            Err(e) => {
                warn!("Could not write report to {}: {}", store.dir().display(), e);
                None
            }
        };

        let notified = self.notifier.notify(&report, mode).await;

        Ok(RunOutcome {
            report,
            persisted,
            notified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FakeExecutor;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use steward_common::{FixedClock, MaintenanceError, OverallStatus, StepRecorder, StepStatus};

    enum Behaviour {
        Finish(StepStatus),
        CriticalDisk,
        Fail,
        Panic,
    }

    struct ScriptedStep {
        name: &'static str,
        behaviour: Behaviour,
        headroom: bool,
    }

    impl ScriptedStep {
        fn boxed(name: &'static str, behaviour: Behaviour) -> Box<dyn MaintenanceStep> {
            Box::new(Self {
                name,
                behaviour,
                headroom: false,
            })
        }

        fn needing_headroom(name: &'static str) -> Box<dyn MaintenanceStep> {
            Box::new(Self {
                name,
                behaviour: Behaviour::Finish(StepStatus::Success),
                headroom: true,
            })
        }
    }

    #[async_trait]
    impl MaintenanceStep for ScriptedStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn needs_disk_headroom(&self) -> bool {
            self.headroom
        }

        async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
            let rec = StepRecorder::start(self.name, ctx.now());
            match self.behaviour {
                Behaviour::Finish(status) => Ok(rec.finish_with(status, ctx.now())),
                Behaviour::CriticalDisk => {
                    let mut rec = rec;
                    rec.detail(DISK_CRITICAL, true);
                    rec.fail("Free space critical");
                    Ok(rec.finish(ctx.now()))
                }
                Behaviour::Fail => Err(MaintenanceError::Internal("boom".to_string())),
                Behaviour::Panic => panic!("step exploded"),
            }
        }
    }

    fn orchestrator(steps: Vec<Box<dyn MaintenanceStep>>) -> Orchestrator {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap());
        Orchestrator::with_steps(
            steps,
            Arc::new(FakeExecutor::new()),
            Arc::new(clock),
            Notifier::disabled(),
        )
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_steps() {
        let orch = orchestrator(vec![
            ScriptedStep::boxed("first", Behaviour::Fail),
            ScriptedStep::boxed("second", Behaviour::Panic),
            ScriptedStep::boxed("third", Behaviour::Finish(StepStatus::Success)),
        ]);
        let report = orch.execute(&AppConfig::default(), RunMode::default()).await.unwrap();

        let names: Vec<_> = report.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert_eq!(report.steps[0].status, StepStatus::Error);
        assert_eq!(report.steps[0].messages, vec!["Internal error: boom".to_string()]);
        assert_eq!(report.steps[1].status, StepStatus::Error);
        assert_eq!(report.steps[1].messages, vec!["step panicked: step exploded".to_string()]);
        assert_eq!(report.steps[2].status, StepStatus::Success);
        assert_eq!(report.overall_status, OverallStatus::Error);
    }

    #[tokio::test]
    async fn test_critical_disk_skips_headroom_steps_only() {
        let orch = orchestrator(vec![
            ScriptedStep::needing_headroom("before"),
            ScriptedStep::boxed("disk", Behaviour::CriticalDisk),
            ScriptedStep::needing_headroom("database"),
            ScriptedStep::boxed("certs", Behaviour::Finish(StepStatus::Success)),
        ]);
        let report = orch.execute(&AppConfig::default(), RunMode::default()).await.unwrap();

        assert_eq!(report.steps.len(), 4);
        assert_eq!(report.step("before").unwrap().status, StepStatus::Success);
        let skipped = report.step("database").unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert!(skipped.messages[0].contains("free space critical"));
        assert_eq!(report.step("certs").unwrap().status, StepStatus::Success);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_warning_maps_to_exit_one() {
        let orch = orchestrator(vec![
            ScriptedStep::boxed("a", Behaviour::Finish(StepStatus::Success)),
            ScriptedStep::boxed("b", Behaviour::Finish(StepStatus::Warning)),
            ScriptedStep::boxed("c", Behaviour::Finish(StepStatus::Skipped)),
        ]);
        let report = orch.execute(&AppConfig::default(), RunMode::default()).await.unwrap();
        assert_eq!(report.overall_status, OverallStatus::Warning);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.run_id, "20250601_030000");
    }

    #[tokio::test]
    async fn test_invalid_config_runs_nothing() {
        let orch = orchestrator(vec![ScriptedStep::boxed("a", Behaviour::Panic)]);
        let mut config = AppConfig::default();
        config.maintenance.min_disk_space_gb = -1.0;
        let err = orch.execute(&config, RunMode::default()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_standard_order() {
        let orch = Orchestrator::standard(
            Arc::new(FakeExecutor::new()),
            Arc::new(FixedClock::new(Utc::now())),
            Box::new(crate::steps::FakeDiskProbe::with_gb(50.0)),
            Notifier::disabled(),
        );
        assert_eq!(
            orch.step_names(),
            vec![
                "service_health",
                "feed_update",
                "retention_cleanup",
                "disk_space",
                "database_optimization",
                "certificate_check"
            ]
        );
    }
}
