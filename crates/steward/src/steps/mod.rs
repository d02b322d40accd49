//! Maintenance steps
//!
//! Each step turns every failure it meets into its own `StepResult`; the
//! orchestrator only ever looks at the status. Steps run strictly in the
//! order the orchestrator holds them.

mod certificates;
mod database;
mod disk;
mod feeds;
mod health;
mod retention;

pub use certificates::{parse_not_after, CertEndpoint, CertificateChecker};
pub use database::DatabaseOptimizer;
pub use disk::{
    classify_disk, DiskLevel, DiskProbe, DiskSpaceMonitor, FakeDiskProbe, SysinfoDiskProbe,
};
pub use feeds::FeedUpdater;
pub use health::ServiceHealthChecker;
pub use retention::{is_expired, RetentionCleaner};

use crate::gmp::GmpClient;
use crate::runner::CommandRunner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use steward_common::{AppConfig, Clock, Result, RunMode, StepResult};

pub const SERVICE_HEALTH: &str = "service_health";
pub const FEED_UPDATE: &str = "feed_update";
pub const RETENTION_CLEANUP: &str = "retention_cleanup";
pub const DISK_SPACE: &str = "disk_space";
pub const DATABASE_OPTIMIZATION: &str = "database_optimization";
pub const CERTIFICATE_CHECK: &str = "certificate_check";

/// Detail flag set by the disk monitor when free space is at or below half the minimum
pub const DISK_CRITICAL: &str = "disk_critical";

/// Everything a step may read during a run
pub struct StepContext<'a> {
    pub config: &'a AppConfig,
    pub mode: RunMode,
    pub runner: CommandRunner<'a>,
    pub clock: &'a dyn Clock,
}

impl<'a> StepContext<'a> {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn gmp(&self) -> GmpClient<'_> {
        GmpClient::new(&self.runner, self.config)
    }
}

/// One unit of the maintenance pipeline
#[async_trait]
pub trait MaintenanceStep: Send + Sync {
    /// Unique within a run
    fn name(&self) -> &'static str;

    /// Steps that must not run on a nearly full volume
    fn needs_disk_headroom(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResult>;
}
