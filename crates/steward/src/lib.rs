//! GVM steward engine: runs the OpenVAS maintenance pipeline
//!
//! Health check, feed update, retention cleanup, disk check, database
//! optimization and certificate check run in that order under the
//! [`Orchestrator`]. Every external system is reached through the
//! [`runner::CommandRunner`], so dry-run and tests never touch the host.

pub mod gmp;
pub mod notifier;
pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod steps;

pub use notifier::{Mailer, Notifier, RecordingMailer, SentMail, SmtpMailer};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use report::{PersistedReport, ReportGenerator, ReportStore};
pub use runner::{
    CommandExecutor, CommandOutput, CommandRunner, CommandSpec, FakeExecutor, FakeResponse,
    ProcessExecutor,
};
pub use steps::{MaintenanceStep, StepContext};
