//! Step results and the maintenance report.

use crate::config::MaintenanceConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Warning,
    Error,
    Skipped,
}

impl StepStatus {
    /// Severity rank; `None` for skipped, which never counts toward the overall status
    pub fn severity(self) -> Option<u8> {
        match self {
            Self::Success => Some(0),
            Self::Warning => Some(1),
            Self::Error => Some(2),
            Self::Skipped => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    /// Marker used in the text rendering
    pub fn marker(self) -> &'static str {
        match self {
            Self::Success => "[OK]",
            Self::Warning => "[WARN]",
            Self::Error => "[FAIL]",
            Self::Skipped => "[SKIP]",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level status: the worst severity across non-skipped steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Success,
    Warning,
    Error,
}

impl OverallStatus {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = StepStatus>,
    {
        statuses
            .into_iter()
            .filter_map(|s| match s {
                StepStatus::Success => Some(OverallStatus::Success),
                StepStatus::Warning => Some(OverallStatus::Warning),
                StepStatus::Error => Some(OverallStatus::Error),
                StepStatus::Skipped => None,
            })
            .max()
            .unwrap_or(OverallStatus::Success)
    }

    /// Process exit code: 0 success, 1 warnings only, 2 any error
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Warning => 1,
            Self::Error => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one maintenance step
///
/// Built once through [`StepRecorder`] (or the `skipped`/`failed`
/// constructors) and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub messages: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Primitive values only (counts, sizes, flags, short strings)
    pub details: BTreeMap<String, Value>,
}

impl StepResult {
    pub fn skipped(step_name: &str, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Skipped,
            messages: vec![reason.into()],
            started_at: at,
            ended_at: at,
            details: BTreeMap::new(),
        }
    }

    pub fn failed(
        step_name: &str,
        reason: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Error,
            messages: vec![reason.into()],
            started_at,
            ended_at,
            details: BTreeMap::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn detail_u64(&self, key: &str) -> Option<u64> {
        self.details.get(key).and_then(Value::as_u64)
    }

    pub fn detail_flag(&self, key: &str) -> bool {
        self.details
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Accumulates messages, details and the worst status seen while a step runs
#[derive(Debug)]
pub struct StepRecorder {
    step_name: String,
    started_at: DateTime<Utc>,
    status: StepStatus,
    messages: Vec<String>,
    details: BTreeMap<String, Value>,
}

impl StepRecorder {
    pub fn start(step_name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.to_string(),
            started_at,
            status: StepStatus::Success,
            messages: Vec::new(),
            details: BTreeMap::new(),
        }
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Escalate the step status; never lowers it
    pub fn raise(&mut self, status: StepStatus) {
        let current = self.status.severity().unwrap_or(0);
        if let Some(next) = status.severity() {
            if next > current {
                self.status = status;
            }
        }
    }

    /// Record a message and escalate in one go
    pub fn warn(&mut self, message: impl Into<String>) {
        self.message(message);
        self.raise(StepStatus::Warning);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.message(message);
        self.raise(StepStatus::Error);
    }

    pub fn detail(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.details.insert(key.into(), value.into());
    }

    pub fn add_to(&mut self, key: &str, amount: u64) {
        let current = self.details.get(key).and_then(Value::as_u64).unwrap_or(0);
        self.details
            .insert(key.to_string(), Value::from(current + amount));
    }

    /// Close the step with the accumulated status
    pub fn finish(self, ended_at: DateTime<Utc>) -> StepResult {
        let status = self.status;
        self.finish_with(status, ended_at)
    }

    /// Close the step with an explicit status, for steps that compute it themselves
    pub fn finish_with(self, status: StepStatus, ended_at: DateTime<Utc>) -> StepResult {
        StepResult {
            step_name: self.step_name,
            status,
            messages: self.messages,
            started_at: self.started_at,
            ended_at,
            details: self.details,
        }
    }
}

/// Aggregated outcome of one maintenance run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub overall_status: OverallStatus,
    /// Execution order
    pub steps: Vec<StepResult>,
    pub config_snapshot: MaintenanceConfig,
}

impl MaintenanceReport {
    pub fn exit_code(&self) -> i32 {
        self.overall_status.exit_code()
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}
