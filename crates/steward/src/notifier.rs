//! Alert mail for degraded runs
//!
//! A run is mailed only when e-mail is enabled for the run and the overall
//! status is warning or error. Delivery is best-effort: a failure is logged
//! and reported as "not sent", never raised into the run status.

use crate::report::ReportGenerator;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use steward_common::{
    MailSettings, MaintenanceError, MaintenanceReport, OverallStatus, Result, RunMode,
};
use tracing::{debug, info, warn};

/// Fallback sender when neither `from` nor `smtp_user` is configured
const DEFAULT_FROM_ADDRESS: &str = "gvm-steward@localhost";

/// Outbound mail channel; `status` is the run status the mail reports
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, subject: &str, body: &str, status: OverallStatus) -> Result<()>;
}

#[async_trait]
impl<M: Mailer + ?Sized> Mailer for Arc<M> {
    async fn send(&self, subject: &str, body: &str, status: OverallStatus) -> Result<()> {
        (**self).send(subject, body, status).await
    }
}

/// SMTP with STARTTLS through lettre
pub struct SmtpMailer {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    from: String,
    to: String,
}

impl SmtpMailer {
    /// `None` when no mail server or recipient is configured
    pub fn from_settings(settings: &MailSettings) -> Option<Self> {
        let host = settings.mailserver.clone().filter(|h| !h.trim().is_empty())?;
        let to = settings.to.clone().filter(|t| !t.trim().is_empty())?;
        let from = settings
            .from
            .clone()
            .or_else(|| settings.smtp_user.clone())
            .unwrap_or_else(|| DEFAULT_FROM_ADDRESS.to_string());
        let credentials = match (&settings.smtp_user, &settings.smtp_pass) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.expose().to_string())),
            _ => None,
        };

        Some(Self {
            host,
            port: settings.smtp_port,
            credentials,
            from,
            to,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, subject: &str, body: &str, status: OverallStatus) -> Result<()> {
        use lettre::{
            message::header::ContentType, transport::smtp::authentication::Credentials,
            AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
        };

        let mail_err = |e: &dyn std::fmt::Display| MaintenanceError::Mail(e.to_string());

        let email = Message::builder()
            .from(self.from.parse().map_err(|e| mail_err(&e))?)
            .to(self.to.parse().map_err(|e| mail_err(&e))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| mail_err(&e))?;

        let mut transport_builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
            .map_err(|e| mail_err(&e))?
            .port(self.port);

        if let Some((user, pass)) = &self.credentials {
            transport_builder =
                transport_builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let mailer = transport_builder.build();
        mailer.send(email).await.map_err(|e| mail_err(&e))?;

        info!(
            to = %self.to,
            host = %self.host,
            status = %status,
            "Maintenance report mailed"
        );
        Ok(())
    }
}

/// A mail captured by [`RecordingMailer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub subject: String,
    pub body: String,
    pub status: OverallStatus,
}

/// Mailer that keeps messages in memory, optionally refusing every delivery
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    refuse: bool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            refuse: true,
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, subject: &str, body: &str, status: OverallStatus) -> Result<()> {
        if self.refuse {
            return Err(MaintenanceError::Mail("connection refused".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMail {
                subject: subject.to_string(),
                body: body.to_string(),
                status,
            });
        }
        Ok(())
    }
}

pub struct Notifier {
    mailer: Option<Box<dyn Mailer>>,
    /// `[<pais>-<site>]`
    tag: String,
}

impl Notifier {
    pub fn new(mailer: Option<Box<dyn Mailer>>, settings: &MailSettings) -> Self {
        Self {
            mailer,
            tag: format!("[{}-{}]", settings.pais, settings.site),
        }
    }

    /// Notifier that never sends
    pub fn disabled() -> Self {
        Self {
            mailer: None,
            tag: String::new(),
        }
    }

    pub fn subject(&self, status: OverallStatus) -> String {
        format!(
            "{} OpenVAS maintenance report: {}",
            self.tag,
            status.as_str().to_uppercase()
        )
    }

    /// Returns whether a mail actually left
    pub async fn notify(&self, report: &MaintenanceReport, mode: RunMode) -> bool {
        if !mode.send_email {
            debug!("E-mail disabled for this run");
            return false;
        }
        if report.overall_status == OverallStatus::Success {
            debug!("Run succeeded, no notification");
            return false;
        }
        let Some(mailer) = &self.mailer else {
            warn!("Notification wanted but no mail server is configured");
            return false;
        };

        let subject = self.subject(report.overall_status);
        let body = ReportGenerator::render_text(report);
        match mailer.send(&subject, &body, report.overall_status).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send maintenance report: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use steward_common::{MaintenanceConfig, StepResult};

    fn report(status: steward_common::StepStatus) -> MaintenanceReport {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        let step = StepResult {
            status,
            ..StepResult::skipped("disk_space", "probe", at)
        };
        ReportGenerator::render(vec![step], &MaintenanceConfig::default(), "20250601_030000", at)
    }

    fn settings() -> MailSettings {
        MailSettings {
            site: "hq".into(),
            pais: "es".into(),
            ..MailSettings::default()
        }
    }

    fn mode(send_email: bool) -> RunMode {
        RunMode {
            send_email,
            ..RunMode::default()
        }
    }

    #[tokio::test]
    async fn test_sends_on_warning_and_error() {
        use steward_common::StepStatus::*;
        let mailer = Arc::new(RecordingMailer::new());
        let notifier = Notifier::new(Some(Box::new(mailer.clone())), &settings());

        assert!(notifier.notify(&report(Warning), mode(true)).await);
        assert!(notifier.notify(&report(Error), mode(true)).await);

        let sent = mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].subject, "[es-hq] OpenVAS maintenance report: WARNING");
        assert_eq!(sent[1].subject, "[es-hq] OpenVAS maintenance report: ERROR");
        assert_eq!(sent[0].status, OverallStatus::Warning);
        assert_eq!(sent[1].status, OverallStatus::Error);
        assert!(sent[1].body.contains("OPENVAS MAINTENANCE REPORT"));
    }

    #[tokio::test]
    async fn test_success_never_sends() {
        let mailer = Arc::new(RecordingMailer::new());
        let notifier = Notifier::new(Some(Box::new(mailer.clone())), &settings());
        assert!(!notifier.notify(&report(steward_common::StepStatus::Success), mode(true)).await);
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_mail_never_sends() {
        let mailer = Arc::new(RecordingMailer::new());
        let notifier = Notifier::new(Some(Box::new(mailer.clone())), &settings());
        assert!(!notifier.notify(&report(steward_common::StepStatus::Error), mode(false)).await);
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_is_not_sent() {
        let notifier = Notifier::new(Some(Box::new(RecordingMailer::refusing())), &settings());
        assert!(!notifier.notify(&report(steward_common::StepStatus::Error), mode(true)).await);
    }

    #[tokio::test]
    async fn test_missing_mailer_is_not_sent() {
        let notifier = Notifier::disabled();
        assert!(!notifier.notify(&report(steward_common::StepStatus::Error), mode(true)).await);
    }

    #[test]
    fn test_smtp_mailer_needs_server_and_recipient() {
        assert!(SmtpMailer::from_settings(&MailSettings::default()).is_none());

        let configured = MailSettings {
            mailserver: Some("smtp.example.org".into()),
            to: Some("soc@example.org".into()),
            smtp_user: Some("scanner@example.org".into()),
            ..MailSettings::default()
        };
        let mailer = SmtpMailer::from_settings(&configured).unwrap();
        assert_eq!(mailer.from, "scanner@example.org");
        assert_eq!(mailer.port, 587);
        assert!(mailer.credentials.is_none());
    }
}
