//! Service health check
//!
//! Queries each configured systemd unit in list order. Inactive units are
//! restarted once (when allowed) and re-checked: a unit that needed a restart
//! is a warning, one that stays down is an error.

use super::{MaintenanceStep, StepContext, SERVICE_HEALTH};
use crate::runner::CommandSpec;
use async_trait::async_trait;
use steward_common::{Result, StepRecorder, StepResult};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceHealthChecker;

#[derive(Debug, Default)]
struct Tally {
    active: u64,
    restarted: u64,
    failed: u64,
    would_restart: u64,
}

impl ServiceHealthChecker {
    pub fn new() -> Self {
        Self
    }

    pub async fn check(&self, ctx: &StepContext<'_>, service_names: &[String]) -> StepResult {
        let mut rec = StepRecorder::start(SERVICE_HEALTH, ctx.now());
        let restart_allowed = ctx.config.maintenance.restart_failed_services;
        let mut tally = Tally::default();

        for service in service_names {
            match self.is_active(ctx, service, &mut rec).await {
                Ok(true) => {
                    tally.active += 1;
                    rec.message(format!("{}: active", service));
                }
                Ok(false) if !restart_allowed => {
                    tally.failed += 1;
                    rec.fail(format!("{}: not active", service));
                }
                Ok(false) if ctx.mode.dry_run => {
                    tally.would_restart += 1;
                    rec.fail(format!("{}: not active (would restart)", service));
                }
                Ok(false) => {
                    warn!("Service {} not active, restarting", service);
                    match self.restart_and_recheck(ctx, service, &mut rec).await {
                        Ok(true) => {
                            tally.restarted += 1;
                            rec.warn(format!("{}: restarted, now active", service));
                        }
                        Ok(false) => {
                            tally.failed += 1;
                            rec.fail(format!("{}: still not active after restart", service));
                        }
                        Err(e) => {
                            tally.failed += 1;
                            rec.fail(format!("{}: restart failed: {}", service, e));
                        }
                    }
                }
                Err(e) => {
                    tally.failed += 1;
                    rec.fail(format!("{}: state query failed: {}", service, e));
                }
            }
        }

        info!(
            "Services checked: {}, failed: {}",
            service_names.len(),
            tally.failed
        );

        rec.detail("services_checked", service_names.len() as u64);
        rec.detail("services_active", tally.active);
        rec.detail("services_restarted", tally.restarted);
        rec.detail("services_failed", tally.failed);
        if ctx.mode.dry_run {
            rec.detail("services_would_restart", tally.would_restart);
        }
        rec.finish(ctx.now())
    }

    async fn is_active(
        &self,
        ctx: &StepContext<'_>,
        service: &str,
        rec: &mut StepRecorder,
    ) -> Result<bool> {
        let spec = CommandSpec::new("systemctl")
            .args(["is-active", service])
            .timeout(ctx.config.platform.timeouts.service_query);
        // is-active exits non-zero for inactive units; only stdout matters
        let output = ctx.runner.run(&spec, rec).await?;
        Ok(output.stdout.trim() == "active")
    }

    async fn restart_and_recheck(
        &self,
        ctx: &StepContext<'_>,
        service: &str,
        rec: &mut StepRecorder,
    ) -> Result<bool> {
        let spec = CommandSpec::new("systemctl")
            .args(["restart", service])
            .timeout(ctx.config.platform.timeouts.service_restart)
            .mutating();
        let output = ctx.runner.run(&spec, rec).await?;
        if !output.success() {
            return Ok(false);
        }
        self.is_active(ctx, service, rec).await
    }
}

#[async_trait]
impl MaintenanceStep for ServiceHealthChecker {
    fn name(&self) -> &'static str {
        SERVICE_HEALTH
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
        Ok(self.check(ctx, &ctx.config.platform.services).await)
    }
}
