//! Configuration model for a maintenance run.
//!
//! Loaded once from the platform's JSON config file (the same document the
//! scanning glue uses) and never modified while a run is in progress.
//! Unknown keys are ignored; missing keys take the defaults below.

use crate::error::{MaintenanceError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Config file path
pub const CONFIG_PATH: &str = "/home/redteam/gvm/Config/config.json";

/// The `maintenance` block; also embedded in every report as the config snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_report_retention_days")]
    pub report_retention_days: u32,

    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    #[serde(default = "default_min_disk_space_gb")]
    pub min_disk_space_gb: f64,

    /// Target removal destroys scan history, so it is opt-in
    #[serde(default)]
    pub clean_old_targets: bool,

    #[serde(default)]
    pub restart_failed_services: bool,

    #[serde(default = "default_true")]
    pub email_on_errors: bool,
}

fn default_report_retention_days() -> u32 {
    90
}

fn default_log_retention_days() -> u32 {
    30
}

fn default_min_disk_space_gb() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            report_retention_days: default_report_retention_days(),
            log_retention_days: default_log_retention_days(),
            min_disk_space_gb: default_min_disk_space_gb(),
            clean_old_targets: false,
            restart_failed_services: false,
            email_on_errors: true,
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.min_disk_space_gb.is_finite() || self.min_disk_space_gb < 0.0 {
            return Err(MaintenanceError::ConfigInvalid(format!(
                "maintenance.min_disk_space_gb must be a non-negative number, got {}",
                self.min_disk_space_gb
            )));
        }
        Ok(())
    }
}

/// One vulnerability feed category and the command that syncs it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSource {
    /// GMP feed type (NVT, GVMD_DATA, SCAP, CERT)
    pub category: String,
    pub command: Vec<String>,
}

impl FeedSource {
    fn greenbone(category: &str, args: &[&str]) -> Self {
        let mut command = vec!["sudo".to_string(), "-u".to_string(), "gvm".to_string()];
        command.extend(args.iter().map(|a| a.to_string()));
        Self {
            category: category.to_string(),
            command,
        }
    }
}

/// Layout of the scanning host: which services, feeds, paths and endpoints to look after
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Checked in this order
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    #[serde(default = "default_feeds")]
    pub feeds: Vec<FeedSource>,

    #[serde(default = "default_feed_poll_attempts")]
    pub feed_poll_attempts: u32,

    #[serde(default = "default_feed_poll_interval")]
    pub feed_poll_interval_secs: u64,

    #[serde(default = "default_feed_sync_timeout")]
    pub feed_sync_timeout_secs: u64,

    #[serde(default = "default_report_export_dirs")]
    pub report_export_dirs: Vec<PathBuf>,

    #[serde(default = "default_report_extensions")]
    pub report_extensions: Vec<String>,

    #[serde(default = "default_log_dirs")]
    pub log_dirs: Vec<PathBuf>,

    #[serde(default = "default_temp_files")]
    pub temp_files: Vec<PathBuf>,

    /// Volume whose free space is checked
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,

    #[serde(default = "default_database")]
    pub database: String,

    /// PEM file paths or `host:port` TLS endpoints
    #[serde(default = "default_certificate_endpoints")]
    pub certificate_endpoints: Vec<String>,

    #[serde(default = "default_cert_warning_days")]
    pub cert_warning_days: u32,

    /// Where run reports are written
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,

    #[serde(default)]
    pub timeouts: CommandTimeouts,
}

fn default_services() -> Vec<String> {
    [
        "gvmd",
        "ospd-openvas",
        "gsad",
        "notus-scanner",
        "postgresql",
        "redis-server@openvas",
        "mosquitto",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_feeds() -> Vec<FeedSource> {
    vec![
        FeedSource::greenbone("NVT", &["greenbone-nvt-sync"]),
        FeedSource::greenbone("GVMD_DATA", &["greenbone-feed-sync", "--type", "GVMD_DATA"]),
        FeedSource::greenbone("SCAP", &["greenbone-feed-sync", "--type", "SCAP"]),
        FeedSource::greenbone("CERT", &["greenbone-feed-sync", "--type", "CERT"]),
    ]
}

fn default_feed_poll_attempts() -> u32 {
    30
}

fn default_feed_poll_interval() -> u64 {
    60
}

fn default_feed_sync_timeout() -> u64 {
    3600
}

fn default_report_export_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/home/redteam/gvm/Reports/exports")]
}

fn default_report_extensions() -> Vec<String> {
    vec!["csv".to_string()]
}

fn default_log_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/var/log/gvm"), PathBuf::from("/home/redteam/gvm")]
}

fn default_temp_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/home/redteam/gvm/tasksend.txt"),
        PathBuf::from("/home/redteam/gvm/taskslog.txt"),
        PathBuf::from("/home/redteam/gvm/logbalbix.txt"),
    ]
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}

fn default_database() -> String {
    "gvmd".to_string()
}

fn default_certificate_endpoints() -> Vec<String> {
    vec![
        "/var/lib/gvm/CA/cacert.pem".to_string(),
        "/var/lib/gvm/CA/servercert.pem".to_string(),
    ]
}

fn default_cert_warning_days() -> u32 {
    30
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("/home/redteam/gvm/logs/maintenance")
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            feeds: default_feeds(),
            feed_poll_attempts: default_feed_poll_attempts(),
            feed_poll_interval_secs: default_feed_poll_interval(),
            feed_sync_timeout_secs: default_feed_sync_timeout(),
            report_export_dirs: default_report_export_dirs(),
            report_extensions: default_report_extensions(),
            log_dirs: default_log_dirs(),
            temp_files: default_temp_files(),
            disk_path: default_disk_path(),
            database: default_database(),
            certificate_endpoints: default_certificate_endpoints(),
            cert_warning_days: default_cert_warning_days(),
            reports_dir: default_reports_dir(),
            timeouts: CommandTimeouts::default(),
        }
    }
}

/// Per-command timeouts in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTimeouts {
    #[serde(default = "default_service_query_timeout")]
    pub service_query: u64,

    #[serde(default = "default_service_restart_timeout")]
    pub service_restart: u64,

    #[serde(default = "default_gmp_timeout")]
    pub gmp: u64,

    #[serde(default = "default_vacuum_timeout")]
    pub vacuum: u64,

    #[serde(default = "default_analyze_timeout")]
    pub analyze: u64,

    #[serde(default = "default_reindex_timeout")]
    pub reindex: u64,

    #[serde(default = "default_db_query_timeout")]
    pub db_query: u64,

    #[serde(default = "default_certificate_timeout")]
    pub certificate: u64,
}

fn default_service_query_timeout() -> u64 {
    5
}

fn default_service_restart_timeout() -> u64 {
    30
}

fn default_gmp_timeout() -> u64 {
    120
}

fn default_vacuum_timeout() -> u64 {
    3600
}

fn default_analyze_timeout() -> u64 {
    1800
}

fn default_reindex_timeout() -> u64 {
    3600
}

fn default_db_query_timeout() -> u64 {
    30
}

fn default_certificate_timeout() -> u64 {
    15
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            service_query: default_service_query_timeout(),
            service_restart: default_service_restart_timeout(),
            gmp: default_gmp_timeout(),
            vacuum: default_vacuum_timeout(),
            analyze: default_analyze_timeout(),
            reindex: default_reindex_timeout(),
            db_query: default_db_query_timeout(),
            certificate: default_certificate_timeout(),
        }
    }
}

/// String that never shows up in Debug output or logs
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"****\"")
    }
}

/// SMTP settings, read from the top level of the config document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailSettings {
    #[serde(default)]
    pub mailserver: Option<String>,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub smtp_user: Option<String>,

    #[serde(default)]
    pub smtp_pass: Option<Secret>,

    #[serde(default)]
    pub from: Option<String>,

    #[serde(default)]
    pub to: Option<String>,

    #[serde(default)]
    pub site: String,

    /// Country code shown in the alert subject
    #[serde(default)]
    pub pais: String,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            mailserver: None,
            smtp_port: default_smtp_port(),
            smtp_user: None,
            smtp_pass: None,
            from: None,
            to: None,
            site: String::new(),
            pais: String::new(),
        }
    }
}

/// Full config document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub platform: PlatformConfig,

    /// GMP username
    #[serde(default = "default_gmp_user")]
    pub user: String,

    #[serde(default = "default_gmp_password")]
    pub password: Secret,

    #[serde(default = "default_gmp_socket")]
    pub gmp_socket: PathBuf,

    #[serde(flatten)]
    pub mail: MailSettings,
}

fn default_gmp_user() -> String {
    "admin".to_string()
}

fn default_gmp_password() -> Secret {
    Secret::new("admin")
}

fn default_gmp_socket() -> PathBuf {
    PathBuf::from("/run/gvmd/gvmd.sock")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            maintenance: MaintenanceConfig::default(),
            platform: PlatformConfig::default(),
            user: default_gmp_user(),
            password: default_gmp_password(),
            gmp_socket: default_gmp_socket(),
            mail: MailSettings::default(),
        }
    }
}

impl AppConfig {
    /// Read, parse and validate the config file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            MaintenanceError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(content)
            .map_err(|e| MaintenanceError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.maintenance.validate()?;

        if self.platform.feed_poll_attempts == 0 {
            return Err(MaintenanceError::ConfigInvalid(
                "platform.feed_poll_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(feed) = self.platform.feeds.iter().find(|f| f.command.is_empty()) {
            return Err(MaintenanceError::ConfigInvalid(format!(
                "feed {} has an empty command",
                feed.category
            )));
        }
        Ok(())
    }
}

/// Per-run mode derived from CLI flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunMode {
    pub dry_run: bool,
    pub verbose: bool,
    pub send_email: bool,
}

impl RunMode {
    /// `no_email` can only switch mail off; it never enables it when the config says no
    pub fn from_flags(
        dry_run: bool,
        verbose: bool,
        no_email: bool,
        config: &MaintenanceConfig,
    ) -> Self {
        Self {
            dry_run,
            verbose,
            send_email: config.email_on_errors && !no_email,
        }
    }
}
