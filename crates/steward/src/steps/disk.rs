//! Free space check on the scanner's data volume

use super::{MaintenanceStep, StepContext, DISK_CRITICAL, DISK_SPACE};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use steward_common::{MaintenanceError, Result, StepRecorder, StepResult};
use sysinfo::Disks;
use tracing::{debug, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of free-space figures
pub trait DiskProbe: Send + Sync {
    /// Bytes available to unprivileged users on the volume holding `path`
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// Reads mounted volumes through sysinfo
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDiskProbe;

impl DiskProbe for SysinfoDiskProbe {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point that contains the path owns it
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| {
                debug!(
                    "{} is on {} ({} bytes free)",
                    path.display(),
                    disk.mount_point().display(),
                    disk.available_space()
                );
                disk.available_space()
            })
            .ok_or_else(|| {
                MaintenanceError::Internal(format!("no mounted volume holds {}", path.display()))
            })
    }
}

/// Scripted probe for tests
#[derive(Debug)]
pub struct FakeDiskProbe {
    available: std::result::Result<u64, String>,
    queried: Mutex<Vec<PathBuf>>,
}

impl FakeDiskProbe {
    pub fn with_gb(gb: f64) -> Self {
        Self::with_bytes((gb * BYTES_PER_GB) as u64)
    }

    pub fn with_bytes(bytes: u64) -> Self {
        Self {
            available: Ok(bytes),
            queried: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            available: Err(reason.to_string()),
            queried: Mutex::new(Vec::new()),
        }
    }

    pub fn queried(&self) -> Vec<PathBuf> {
        self.queried.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

impl DiskProbe for FakeDiskProbe {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        if let Ok(mut queried) = self.queried.lock() {
            queried.push(path.to_path_buf());
        }
        self.available
            .clone()
            .map_err(MaintenanceError::Internal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskLevel {
    Ok,
    Low,
    Critical,
}

/// `Ok` at or above the minimum, `Critical` at or below half of it
pub fn classify_disk(available_gb: f64, min_gb: f64) -> DiskLevel {
    if available_gb >= min_gb {
        DiskLevel::Ok
    } else if available_gb > min_gb / 2.0 {
        DiskLevel::Low
    } else {
        DiskLevel::Critical
    }
}

pub struct DiskSpaceMonitor {
    probe: Box<dyn DiskProbe>,
}

impl DiskSpaceMonitor {
    pub fn new(probe: Box<dyn DiskProbe>) -> Self {
        Self { probe }
    }

    pub fn check(&self, ctx: &StepContext<'_>, min_disk_space_gb: f64) -> StepResult {
        let mut rec = StepRecorder::start(DISK_SPACE, ctx.now());
        let path = &ctx.config.platform.disk_path;
        rec.detail("path", path.display().to_string());
        rec.detail("min_disk_space_gb", min_disk_space_gb);

        let bytes = match self.probe.available_bytes(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                rec.fail(format!("cannot measure free space on {}: {}", path.display(), e));
                return rec.finish(ctx.now());
            }
        };

        let available_gb = bytes as f64 / BYTES_PER_GB;
        let rounded = (available_gb * 100.0).round() / 100.0;
        rec.detail("available_gb", rounded);

        let level = classify_disk(available_gb, min_disk_space_gb);
        rec.detail(DISK_CRITICAL, level == DiskLevel::Critical);

        match level {
            DiskLevel::Ok => rec.message(format!(
                "{:.2} GB available on {} (minimum {} GB)",
                available_gb,
                path.display(),
                min_disk_space_gb
            )),
            DiskLevel::Low => {
                warn!("Low disk space: {:.2} GB", available_gb);
                rec.warn(format!(
                    "Low free space: {:.2} GB available (minimum {} GB)",
                    available_gb, min_disk_space_gb
                ));
            }
            DiskLevel::Critical => {
                let critical = MaintenanceError::ResourceThresholdCritical {
                    available_gb,
                    min_gb: min_disk_space_gb,
                };
                warn!("{}", critical);
                rec.fail(critical.to_string());
            }
        }

        rec.finish(ctx.now())
    }
}

#[async_trait]
impl MaintenanceStep for DiskSpaceMonitor {
    fn name(&self) -> &'static str {
        DISK_SPACE
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
        Ok(self.check(ctx, ctx.config.maintenance.min_disk_space_gb))
    }
}
