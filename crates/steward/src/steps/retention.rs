//! Retention cleanup
//!
//! Removes whatever has outlived its retention window:
//! - `scan_reports`: gvmd reports older than the report window
//! - `report_files`: exported report files (CSV by default), report window
//! - `log_files`: `*.log` directly inside the log directories, log window
//! - `temp_files`: scratch files left by the scanning glue, whenever present
//! - `targets`: stale scan targets, only when explicitly enabled
//!
//! An item is expired only when strictly older than its cutoff; an item whose
//! age equals the window is kept. Dry-run counts and lists, never deletes.

use super::{MaintenanceStep, StepContext, RETENTION_CLEANUP};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use steward_common::{Result, StepRecorder, StepResult};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Listed individually in dry-run up to this many items per category
const MAX_LISTED: usize = 20;

#[derive(Debug, Default, Clone, Copy)]
pub struct RetentionCleaner;

/// Expiry rule shared by every category
pub fn is_expired(modified: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    modified < cutoff
}

/// `now - days`, or `None` when the window reaches before the earliest
/// representable time and nothing can be old enough to expire
pub fn retention_cutoff(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(Duration::days(i64::from(days)))
}

fn cutoff_detail(cutoff: Option<DateTime<Utc>>) -> String {
    cutoff.map_or_else(|| "none".to_string(), |c| c.to_rfc3339())
}

#[derive(Debug)]
struct FileCandidate {
    path: PathBuf,
    size: u64,
}

/// Per-category bookkeeping
struct Category<'r> {
    name: &'static str,
    dry_run: bool,
    count: u64,
    bytes: u64,
    listed: usize,
    rec: &'r mut StepRecorder,
}

impl<'r> Category<'r> {
    fn new(name: &'static str, dry_run: bool, rec: &'r mut StepRecorder) -> Self {
        Self {
            name,
            dry_run,
            count: 0,
            bytes: 0,
            listed: 0,
            rec,
        }
    }

    fn removed(&mut self, item: &str, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
        if self.dry_run {
            if self.listed < MAX_LISTED {
                self.rec
                    .message(format!("[dry-run] would remove {}: {}", self.name, item));
            }
            self.listed += 1;
        }
    }

    fn close(self, track_bytes: bool) {
        let suffix = if self.dry_run { "would_remove" } else { "removed" };
        if self.dry_run && self.listed > MAX_LISTED {
            self.rec.message(format!(
                "[dry-run] ... and {} more {}",
                self.listed - MAX_LISTED,
                self.name
            ));
        }
        self.rec.detail(format!("{}_{}", self.name, suffix), self.count);
        if track_bytes {
            self.rec.detail(format!("{}_bytes", self.name), self.bytes);
        }
        info!("{}: {} {}", self.name, suffix.replace('_', " "), self.count);
    }
}

impl RetentionCleaner {
    pub fn new() -> Self {
        Self
    }

    pub async fn clean(
        &self,
        ctx: &StepContext<'_>,
        report_retention_days: u32,
        log_retention_days: u32,
        clean_old_targets: bool,
        is_dry_run: bool,
    ) -> StepResult {
        let now = ctx.now();
        let mut rec = StepRecorder::start(RETENTION_CLEANUP, now);
        let report_cutoff = retention_cutoff(now, report_retention_days);
        let log_cutoff = retention_cutoff(now, log_retention_days);
        let platform = &ctx.config.platform;

        rec.detail("dry_run", is_dry_run);
        rec.detail("report_cutoff", cutoff_detail(report_cutoff));
        rec.detail("log_cutoff", cutoff_detail(log_cutoff));

        // Nothing is strictly older than the earliest representable instant
        let report_cutoff = report_cutoff.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let log_cutoff = log_cutoff.unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.clean_scan_reports(ctx, report_cutoff, is_dry_run, &mut rec)
            .await;

        let report_files = expired_files(
            &platform.report_export_dirs,
            &platform.report_extensions,
            report_cutoff,
            &mut rec,
        );
        remove_files("report_files", report_files, is_dry_run, &mut rec);

        let log_files = expired_files(
            &platform.log_dirs,
            &["log".to_string()],
            log_cutoff,
            &mut rec,
        );
        remove_files("log_files", log_files, is_dry_run, &mut rec);

        let temp_files = platform
            .temp_files
            .iter()
            .filter_map(|path| {
                let meta = std::fs::metadata(path).ok()?;
                meta.is_file().then(|| FileCandidate {
                    path: path.clone(),
                    size: meta.len(),
                })
            })
            .collect();
        remove_files("temp_files", temp_files, is_dry_run, &mut rec);

        if clean_old_targets {
            self.clean_targets(ctx, report_cutoff, is_dry_run, &mut rec)
                .await;
        } else {
            debug!("Target cleanup disabled");
        }

        rec.finish(ctx.now())
    }

    async fn clean_scan_reports(
        &self,
        ctx: &StepContext<'_>,
        cutoff: DateTime<Utc>,
        dry_run: bool,
        rec: &mut StepRecorder,
    ) {
        let gmp = ctx.gmp();
        let reports = match gmp.get_reports(rec).await {
            Ok(reports) => reports,
            Err(e) => {
                rec.fail(format!("scan_reports: gvmd unreachable, not cleaned: {}", e));
                return;
            }
        };

        let mut undated = 0u64;
        let mut expired = Vec::new();
        for report in reports {
            match report.timestamp {
                Some(ts) if is_expired(ts, cutoff) => expired.push(report),
                Some(_) => {}
                None => undated += 1,
            }
        }
        if undated > 0 {
            rec.message(format!(
                "scan_reports: {} reports without a timestamp kept",
                undated
            ));
        }

        let mut failures = Vec::new();
        let mut category = Category::new("scan_reports", dry_run, rec);
        for report in expired {
            if dry_run {
                category.removed(&report.id, 0);
                continue;
            }
            match gmp.delete_report(&report.id, &mut *category.rec).await {
                Ok(()) => category.removed(&report.id, 0),
                Err(e) => failures.push(format!(
                    "scan_reports: could not delete {}: {}",
                    report.id, e
                )),
            }
        }
        category.close(false);

        for failure in failures {
            rec.warn(failure);
        }
    }

    async fn clean_targets(
        &self,
        ctx: &StepContext<'_>,
        cutoff: DateTime<Utc>,
        dry_run: bool,
        rec: &mut StepRecorder,
    ) {
        let gmp = ctx.gmp();
        let targets = match gmp.get_targets(rec).await {
            Ok(targets) => targets,
            Err(e) => {
                rec.fail(format!("targets: gvmd unreachable, not cleaned: {}", e));
                return;
            }
        };

        let mut in_use = 0u64;
        let mut failures = Vec::new();
        let mut category = Category::new("targets", dry_run, rec);
        for target in targets {
            let stale = target.timestamp.map_or(false, |ts| is_expired(ts, cutoff));
            if !stale {
                continue;
            }
            if target.in_use {
                in_use += 1;
                continue;
            }
            let label = format!("{} ({})", target.name, target.id);
            if dry_run {
                category.removed(&label, 0);
                continue;
            }
            match gmp.delete_target(&target.id, &mut *category.rec).await {
                Ok(()) => category.removed(&label, 0),
                Err(e) => {
                    failures.push(format!("targets: could not delete {}: {}", label, e))
                }
            }
        }
        category.close(false);

        rec.detail("targets_in_use_kept", in_use);
        for failure in failures {
            rec.warn(failure);
        }
    }
}

/// Files directly inside `dirs` with one of `extensions`, strictly older than `cutoff`
fn expired_files(
    dirs: &[PathBuf],
    extensions: &[String],
    cutoff: DateTime<Utc>,
    rec: &mut StepRecorder,
) -> Vec<FileCandidate> {
    let mut candidates = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            debug!("Skipping missing directory {}", dir.display());
            continue;
        }
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    rec.warn(format!("cannot read {}: {}", dir.display(), e));
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_extension(entry.path(), extensions) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    rec.warn(format!("cannot stat {}: {}", entry.path().display(), e));
                    continue;
                }
            };
            let modified = match meta.modified() {
                Ok(time) => DateTime::<Utc>::from(time),
                Err(_) => continue,
            };
            if is_expired(modified, cutoff) {
                candidates.push(FileCandidate {
                    path: entry.path().to_path_buf(),
                    size: meta.len(),
                });
            }
        }
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn remove_files(
    name: &'static str,
    files: Vec<FileCandidate>,
    dry_run: bool,
    rec: &mut StepRecorder,
) {
    let mut failures = Vec::new();
    let mut category = Category::new(name, dry_run, rec);
    for file in files {
        let shown = file.path.display().to_string();
        if dry_run {
            category.removed(&shown, file.size);
            continue;
        }
        match std::fs::remove_file(&file.path) {
            Ok(()) => category.removed(&shown, file.size),
            Err(e) => {
                warn!("Failed to remove {}: {}", shown, e);
                failures.push(format!("{}: could not remove {}: {}", name, shown, e));
            }
        }
    }
    category.close(true);

    for failure in failures {
        rec.warn(failure);
    }
}

#[async_trait]
impl MaintenanceStep for RetentionCleaner {
    fn name(&self) -> &'static str {
        RETENTION_CLEANUP
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
        let maintenance = &ctx.config.maintenance;
        Ok(self
            .clean(
                ctx,
                maintenance.report_retention_days,
                maintenance.log_retention_days,
                maintenance.clean_old_targets,
                ctx.mode.dry_run,
            )
            .await)
    }
}
