//! Shared types for the GVM steward: configuration, step results, reports,
//! errors and the clock abstraction.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    AppConfig, CommandTimeouts, FeedSource, MailSettings, MaintenanceConfig, PlatformConfig,
    RunMode, Secret, CONFIG_PATH,
};
pub use error::{MaintenanceError, Result};
pub use types::{MaintenanceReport, OverallStatus, StepRecorder, StepResult, StepStatus};
