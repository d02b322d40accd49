//! Report generation and persistence
//!
//! Rendering is pure: the same steps, config, run id and timestamp always give
//! byte-identical JSON and text. Only [`ReportStore::persist`] touches disk.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use steward_common::{
    MaintenanceConfig, MaintenanceReport, OverallStatus, Result, StepResult, StepStatus,
};
use tracing::info;

/// `run_id` format, also used in artifact file names
pub const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

const RULE: &str = "======================================================================";

pub struct ReportGenerator;

impl ReportGenerator {
    pub fn run_id(at: DateTime<Utc>) -> String {
        at.format(RUN_ID_FORMAT).to_string()
    }

    pub fn render(
        steps: Vec<StepResult>,
        config: &MaintenanceConfig,
        run_id: &str,
        generated_at: DateTime<Utc>,
    ) -> MaintenanceReport {
        let overall_status = OverallStatus::from_statuses(steps.iter().map(|s| s.status));
        MaintenanceReport {
            run_id: run_id.to_string(),
            generated_at,
            overall_status,
            steps,
            config_snapshot: config.clone(),
        }
    }

    pub fn render_json(report: &MaintenanceReport) -> Result<String> {
        Ok(serde_json::to_string_pretty(report)?)
    }

    /// Human-readable rendering used for the `.txt` artifact, the mail body and the console
    pub fn render_text(report: &MaintenanceReport) -> String {
        let mut output = String::new();

        output.push_str(RULE);
        output.push('\n');
        output.push_str("OPENVAS MAINTENANCE REPORT\n");
        output.push_str(RULE);
        output.push('\n');
        output.push_str(&format!("Run ID:         {}\n", report.run_id));
        output.push_str(&format!(
            "Generated:      {}\n",
            report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        output.push_str(&format!(
            "Overall status: {}\n\n",
            report.overall_status.as_str().to_uppercase()
        ));

        let config = &report.config_snapshot;
        output.push_str("CONFIGURATION:\n");
        output.push_str(&format!(
            "  Report retention: {} days\n",
            config.report_retention_days
        ));
        output.push_str(&format!("  Log retention:    {} days\n", config.log_retention_days));
        output.push_str(&format!("  Minimum free:     {} GB\n\n", config.min_disk_space_gb));

        for (idx, step) in report.steps.iter().enumerate() {
            output.push_str(&format!(
                "[{}/{}] {} {} ({:.1}s)\n",
                idx + 1,
                report.steps.len(),
                step.status.marker(),
                step.step_name,
                step_seconds(step)
            ));
            for message in &step.messages {
                output.push_str(&format!("    {}\n", message));
            }
            if !step.details.is_empty() {
                output.push_str("    details:\n");
                for (key, value) in &step.details {
                    output.push_str(&format!("      {}: {}\n", key, detail_text(value)));
                }
            }
            output.push('\n');
        }

        let freed = cleanup_bytes(report);
        if freed > 0 {
            output.push_str(&format!("Space reclaimed by cleanup: {}\n\n", format_bytes(freed)));
        }

        output.push_str("SUMMARY:\n");
        for status in [
            StepStatus::Success,
            StepStatus::Warning,
            StepStatus::Error,
            StepStatus::Skipped,
        ] {
            output.push_str(&format!(
                "  {:<8} {}\n",
                format!("{}:", status.as_str()),
                report.count(status)
            ));
        }
        output.push_str(RULE);
        output.push('\n');

        output
    }
}

fn step_seconds(step: &StepResult) -> f64 {
    (step.ended_at - step.started_at).num_milliseconds().max(0) as f64 / 1000.0
}

fn detail_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sum of every `*_bytes` detail across the run
pub fn cleanup_bytes(report: &MaintenanceReport) -> u64 {
    report
        .steps
        .iter()
        .flat_map(|s| s.details.iter())
        .filter(|(key, _)| key.ends_with("_bytes"))
        .filter_map(|(_, value)| value.as_u64())
        .sum()
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;

    let (value, unit) = if bytes >= GIB {
        (bytes as f64 / GIB as f64, "GiB")
    } else if bytes >= MIB {
        (bytes as f64 / MIB as f64, "MiB")
    } else if bytes >= KIB {
        (bytes as f64 / KIB as f64, "KiB")
    } else {
        return format!("{} B", bytes);
    };

    format!("{:.1} {}", value, unit)
}

/// Paths written for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedReport {
    pub json: PathBuf,
    pub text: PathBuf,
}

/// Directory holding `maintenance_report_<run_id>.{json,txt}`
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn persist(&self, report: &MaintenanceReport) -> Result<PersistedReport> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let stem = format!("maintenance_report_{}", report.run_id);
        let json = self.dir.join(format!("{}.json", stem));
        let text = self.dir.join(format!("{}.txt", stem));

        tokio::fs::write(&json, ReportGenerator::render_json(report)?).await?;
        tokio::fs::write(&text, ReportGenerator::render_text(report)).await?;

        info!("Report saved to {}", json.display());
        Ok(PersistedReport { json, text })
    }
}
