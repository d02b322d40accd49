//! TLS certificate expiry check
//!
//! Endpoints are PEM files on disk or live `host:port` services. An endpoint
//! that cannot be read is reported as unreachable, never as expired.

use super::{MaintenanceStep, StepContext, CERTIFICATE_CHECK};
use crate::runner::{snippet, CommandSpec};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use steward_common::{MaintenanceError, Result, StepRecorder, StepResult};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertEndpoint {
    File(PathBuf),
    Remote { host: String, port: u16 },
}

impl CertEndpoint {
    /// `host:port` when the suffix is a port and the host looks like a hostname, a path otherwise
    pub fn parse(endpoint: &str) -> Self {
        let endpoint = endpoint.trim();
        if !endpoint.contains('/') {
            if let Some((host, port)) = endpoint.rsplit_once(':') {
                let valid_host = !host.is_empty()
                    && host
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
                if let (true, Ok(port)) = (valid_host, port.parse::<u16>()) {
                    return CertEndpoint::Remote {
                        host: host.to_string(),
                        port,
                    };
                }
            }
        }
        CertEndpoint::File(PathBuf::from(endpoint))
    }

    fn command(&self, timeout_secs: u64) -> CommandSpec {
        let spec = match self {
            CertEndpoint::File(path) => CommandSpec::new("openssl")
                .args(["x509", "-noout", "-enddate", "-in"])
                .arg(path.display().to_string()),
            // Host charset is restricted by parse(), so it is safe inside the pipeline
            CertEndpoint::Remote { host, port } => CommandSpec::new("sh").arg("-c").arg(format!(
                "openssl s_client -connect {host}:{port} -servername {host} \
                 </dev/null 2>/dev/null | openssl x509 -noout -enddate"
            )),
        };
        spec.timeout(timeout_secs)
    }
}

impl fmt::Display for CertEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertEndpoint::File(path) => write!(f, "{}", path.display()),
            CertEndpoint::Remote { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Parse `notAfter=Jan 15 10:30:00 2026 GMT` as printed by `openssl x509 -enddate`
pub fn parse_not_after(output: &str) -> Option<DateTime<Utc>> {
    let line = output
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("notAfter="))?;
    let without_zone = line.trim().trim_end_matches("GMT").trim();
    let normalized = without_zone.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Default)]
struct Tally {
    valid: u64,
    expiring: u64,
    expired: u64,
    unreachable: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CertificateChecker;

impl CertificateChecker {
    pub fn new() -> Self {
        Self
    }

    pub async fn check(&self, ctx: &StepContext<'_>, endpoints: &[String]) -> StepResult {
        let now = ctx.now();
        let mut rec = StepRecorder::start(CERTIFICATE_CHECK, now);
        let warning_days = i64::from(ctx.config.platform.cert_warning_days);
        let mut tally = Tally::default();

        for raw in endpoints {
            let endpoint = CertEndpoint::parse(raw);
            let not_after = match self.read_expiry(ctx, &endpoint, &mut rec).await {
                Ok(not_after) => not_after,
                Err(e) => {
                    tally.unreachable += 1;
                    warn!("Certificate endpoint {} unreachable: {}", endpoint, e);
                    rec.fail(format!("{}: unreachable ({})", endpoint, e));
                    rec.detail(endpoint.to_string(), "unreachable");
                    continue;
                }
            };

            let days_left = (not_after - now).num_days();
            rec.detail(endpoint.to_string(), not_after.format("%Y-%m-%d").to_string());

            if not_after <= now {
                tally.expired += 1;
                rec.fail(format!(
                    "{}: expired on {}",
                    endpoint,
                    not_after.format("%Y-%m-%d")
                ));
            } else if not_after - now < Duration::days(warning_days) {
                tally.expiring += 1;
                rec.warn(format!("{}: expires in {} days", endpoint, days_left));
            } else {
                tally.valid += 1;
                rec.message(format!("{}: valid for {} more days", endpoint, days_left));
            }
        }

        rec.detail("certificates_checked", endpoints.len() as u64);
        rec.detail("certificates_valid", tally.valid);
        rec.detail("certificates_expiring", tally.expiring);
        rec.detail("certificates_expired", tally.expired);
        rec.detail("certificates_unreachable", tally.unreachable);
        rec.finish(ctx.now())
    }

    async fn read_expiry(
        &self,
        ctx: &StepContext<'_>,
        endpoint: &CertEndpoint,
        rec: &mut StepRecorder,
    ) -> Result<DateTime<Utc>> {
        if let CertEndpoint::File(path) = endpoint {
            if !path.is_file() {
                return Err(MaintenanceError::BackendUnreachable(
                    "file not found".to_string(),
                ));
            }
        }

        let spec = endpoint.command(ctx.config.platform.timeouts.certificate);
        let output = ctx.runner.run(&spec, rec).await?;
        debug!("{} -> {}", endpoint, output.stdout.trim());

        if !output.success() {
            return Err(MaintenanceError::BackendUnreachable(format!(
                "openssl exited with {}: {}",
                output.exit_code,
                snippet(&output.stderr, 120)
            )));
        }
        parse_not_after(&output.stdout).ok_or_else(|| {
            MaintenanceError::BackendUnreachable("no certificate presented".to_string())
        })
    }
}

#[async_trait]
impl MaintenanceStep for CertificateChecker {
    fn name(&self) -> &'static str {
        CERTIFICATE_CHECK
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
        Ok(self
            .check(ctx, &ctx.config.platform.certificate_endpoints)
            .await)
    }
}
