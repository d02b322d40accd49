//! Console output for a finished run

use owo_colors::OwoColorize;
use steward::{ReportGenerator, RunOutcome};
use steward_common::{MaintenanceReport, OverallStatus, RunMode, StepStatus};

pub fn print_json(report: &MaintenanceReport) -> anyhow::Result<()> {
    println!("{}", ReportGenerator::render_json(report)?);
    Ok(())
}

/// Status marker padded to a fixed column, then coloured
fn marker_cell(status: StepStatus) -> String {
    let cell = format!("{:<7}", status.marker());
    match status {
        StepStatus::Success => cell.bright_green().to_string(),
        StepStatus::Warning => cell.yellow().to_string(),
        StepStatus::Error => cell.bright_red().to_string(),
        StepStatus::Skipped => cell.dimmed().to_string(),
    }
}

pub fn print_summary(outcome: &RunOutcome, mode: RunMode) {
    let report = &outcome.report;

    for step in &report.steps {
        println!("{} {}", marker_cell(step.status), step.step_name);
        if mode.verbose || step.status != StepStatus::Success {
            for message in &step.messages {
                println!("        {}", message);
            }
        }
    }

    println!();
    let status = report.overall_status.as_str().to_uppercase();
    let status = match report.overall_status {
        OverallStatus::Success => status.bright_green().to_string(),
        OverallStatus::Warning => status.yellow().to_string(),
        OverallStatus::Error => status.bright_red().to_string(),
    };
    println!(
        "Maintenance {}: {} (exit {})",
        report.run_id,
        status,
        report.exit_code()
    );
    if mode.dry_run {
        println!("{}", "Dry-run: nothing was changed".cyan());
    }

    match &outcome.persisted {
        Some(paths) => println!("Report: {}", paths.text.display()),
        None => println!("{}", "Report could not be saved".yellow()),
    }
    if outcome.notified {
        println!("Alert mail sent");
    }
}

pub fn print_fatal(err: &anyhow::Error) {
    eprintln!("{} {:#}", "[FATAL]".bright_red(), err);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Text as it appears on a terminal, colour codes removed
    fn visible(text: &str) -> String {
        let mut out = String::new();
        let mut in_escape = false;
        for c in text.chars() {
            match (in_escape, c) {
                (false, '\x1b') => in_escape = true,
                (true, 'm') => in_escape = false,
                (true, _) => {}
                (false, c) => out.push(c),
            }
        }
        out
    }

    #[test]
    fn test_marker_cells_line_up() {
        for status in [
            StepStatus::Success,
            StepStatus::Warning,
            StepStatus::Error,
            StepStatus::Skipped,
        ] {
            let cell = marker_cell(status);
            assert_ne!(cell, visible(&cell));
            assert_eq!(visible(&cell).len(), 7);
            assert!(visible(&cell).starts_with(status.marker()));
        }
    }
}
