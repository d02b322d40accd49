//! Minimal Greenbone Management Protocol client
//!
//! Requests go through `gvm-cli` over the gvmd unix socket, so gvmd is reached
//! through the same [`CommandRunner`] as every other backend. Responses are
//! read as text: only ids, names, timestamps, `in_use` flags and feed sync
//! markers are extracted.
//!
//! Credentials never go on the command line. Each request writes them to a
//! private (0600) gvm-tools config file that lives only as long as the call.

use crate::runner::{snippet, CommandRunner, CommandSpec};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use steward_common::{AppConfig, MaintenanceError, Result, Secret, StepRecorder};
use tempfile::NamedTempFile;

/// A report or target as listed by gvmd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmpRecord {
    pub id: String,
    pub name: String,
    /// Scan time for reports, modification time for targets
    pub timestamp: Option<DateTime<Utc>>,
    pub in_use: bool,
}

/// Sync state of one feed type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedState {
    pub feed_type: String,
    pub currently_syncing: bool,
}

/// How a request is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Query,
    /// Full listing; parsed, so the output must not be cut
    Listing,
    /// Changes gvmd state; simulated in dry-run
    Change,
}

pub struct GmpClient<'a> {
    runner: &'a CommandRunner<'a>,
    username: String,
    password: Secret,
    socket: PathBuf,
    timeout_secs: u64,
}

impl<'a> GmpClient<'a> {
    pub fn new(runner: &'a CommandRunner<'a>, config: &AppConfig) -> Self {
        Self {
            runner,
            username: config.user.clone(),
            password: config.password.clone(),
            socket: config.gmp_socket.clone(),
            timeout_secs: config.platform.timeouts.gmp,
        }
    }

    fn credentials_file(&self) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("gvm-steward-")
            .suffix(".conf")
            .tempfile()?;
        write!(
            file,
            "[Auth]\ngmp_username={}\ngmp_password={}\n",
            self.username,
            self.password.expose()
        )?;
        file.flush()?;
        Ok(file)
    }

    fn command(&self, credentials: &Path, xml: &str, call: Call) -> CommandSpec {
        let spec = CommandSpec::new("gvm-cli")
            .arg("--config")
            .arg(credentials.display().to_string())
            .arg("socket")
            .arg("--socketpath")
            .arg(self.socket.display().to_string())
            .arg("--xml")
            .arg(xml)
            .timeout(self.timeout_secs);
        match call {
            Call::Query => spec,
            Call::Listing => spec.uncapped(),
            Call::Change => spec.mutating(),
        }
    }

    async fn request(&self, xml: &str, call: Call, rec: &mut StepRecorder) -> Result<String> {
        // Removed from disk when dropped at the end of the call
        let credentials = self.credentials_file()?;
        let spec = self.command(credentials.path(), xml, call);
        let output = self.runner.run(&spec, rec).await?;
        if output.simulated {
            return Ok(String::new());
        }
        if !output.success() {
            return Err(MaintenanceError::BackendUnreachable(format!(
                "gvm-cli exited with {}: {}",
                output.exit_code,
                snippet(&output.stderr, 200)
            )));
        }
        match parse_status(&output.stdout) {
            Some((status, _)) if (200..300).contains(&status) => Ok(output.stdout),
            Some((status, text)) => Err(MaintenanceError::GmpRejected { status, text }),
            None => Err(MaintenanceError::BackendUnreachable(
                "gvmd returned no GMP response".to_string(),
            )),
        }
    }

    pub async fn get_feeds(&self, rec: &mut StepRecorder) -> Result<Vec<FeedState>> {
        let xml = self.request("<get_feeds/>", Call::Query, rec).await?;
        Ok(parse_feeds(&xml))
    }

    pub async fn get_reports(&self, rec: &mut StepRecorder) -> Result<Vec<GmpRecord>> {
        let request = r#"<get_reports filter="rows=-1" details="0" ignore_pagination="1"/>"#;
        let xml = self.request(request, Call::Listing, rec).await?;
        Ok(parse_records(&xml, "report", &["timestamp", "creation_time"]))
    }

    pub async fn delete_report(&self, id: &str, rec: &mut StepRecorder) -> Result<()> {
        let request = format!(r#"<delete_report report_id="{}"/>"#, id);
        self.request(&request, Call::Change, rec).await.map(|_| ())
    }

    pub async fn get_targets(&self, rec: &mut StepRecorder) -> Result<Vec<GmpRecord>> {
        let xml = self
            .request(r#"<get_targets filter="rows=-1"/>"#, Call::Listing, rec)
            .await?;
        Ok(parse_records(
            &xml,
            "target",
            &["modification_time", "creation_time"],
        ))
    }

    pub async fn delete_target(&self, id: &str, rec: &mut StepRecorder) -> Result<()> {
        let request = format!(r#"<delete_target target_id="{}" ultimate="1"/>"#, id);
        self.request(&request, Call::Change, rec).await.map(|_| ())
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static GMP pattern"))
}

/// Status code and text of the outermost `*_response` element
pub fn parse_status(xml: &str) -> Option<(u16, String)> {
    static STATUS: OnceLock<Regex> = OnceLock::new();
    static TEXT: OnceLock<Regex> = OnceLock::new();
    let status_re = regex(&STATUS, r#"<\w+_response[^>]*?\sstatus="(\d{3})""#);
    let text_re = regex(&TEXT, r#"<\w+_response[^>]*?\sstatus_text="([^"]*)""#);

    let status = status_re.captures(xml)?.get(1)?.as_str().parse().ok()?;
    let text = text_re
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Some((status, text))
}

pub fn parse_feeds(xml: &str) -> Vec<FeedState> {
    static FEED: OnceLock<Regex> = OnceLock::new();
    let feed_re = regex(&FEED, r"(?s)<feed>(.*?)</feed>");

    feed_re
        .captures_iter(xml)
        .filter_map(|c| {
            let body = c.get(1)?.as_str();
            let feed_type = element_text(body, "type")?;
            Some(FeedState {
                feed_type,
                currently_syncing: body.contains("<currently_syncing>"),
            })
        })
        .collect()
}

/// Split a listing into one record per element id
///
/// gvmd nests a second `<report id=...>` inside each report, so segments that
/// share an id are folded together before fields are read. The first of
/// `time_fields` that parses wins.
pub fn parse_records(xml: &str, tag: &str, time_fields: &[&str]) -> Vec<GmpRecord> {
    let open = match Regex::new(&format!(r#"<{}\s+id="([^"]+)""#, regex::escape(tag))) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };

    let starts: Vec<(usize, String)> = open
        .captures_iter(xml)
        .filter_map(|c| {
            let whole = c.get(0)?;
            Some((whole.start(), c.get(1)?.as_str().to_string()))
        })
        .collect();

    let mut grouped: Vec<(String, String)> = Vec::new();
    for (idx, (start, id)) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).map(|(s, _)| *s).unwrap_or(xml.len());
        let segment = &xml[*start..end];
        match grouped.iter_mut().find(|(gid, _)| gid == id) {
            Some((_, body)) => body.push_str(segment),
            None => grouped.push((id.clone(), segment.to_string())),
        }
    }

    static OWNER: OnceLock<Regex> = OnceLock::new();
    let owner_re = regex(&OWNER, r"(?s)<owner>.*?</owner>");

    grouped
        .into_iter()
        .map(|(id, body)| GmpRecord {
            // The owner block carries its own <name>
            name: element_text(&owner_re.replace_all(&body, ""), "name").unwrap_or_default(),
            timestamp: time_fields
                .iter()
                .filter_map(|field| element_text(&body, field))
                .find_map(|text| parse_gmp_time(&text)),
            in_use: element_text(&body, "in_use").as_deref() == Some("1"),
            id,
        })
        .collect()
}

fn element_text(body: &str, element: &str) -> Option<String> {
    let open = format!("<{}>", element);
    let close = format!("</{}>", element);
    let start = body.find(&open)? + open.len();
    let len = body[start..].find(&close)?;
    Some(body[start..start + len].trim().to_string())
}

/// GMP times are RFC 3339 (`2024-01-15T10:30:00Z`)
pub fn parse_gmp_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandExecutor, CommandOutput, ProcessExecutor, MAX_OUTPUT_BYTES};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    const REPORTS: &str = r#"<get_reports_response status="200" status_text="OK">
<report id="a1" format_id="" extension="xml" content_type="text/xml">
  <owner><name>admin</name></owner>
  <name>2024-01-15T10:30:00Z</name>
  <creation_time>2024-01-15T10:30:00Z</creation_time>
  <report id="a1"><timestamp>2024-01-15T10:30:00Z</timestamp><scan_run_status>Done</scan_run_status></report>
</report>
<report id="b2" format_id="" extension="xml" content_type="text/xml">
  <owner><name>admin</name></owner>
  <name>2025-05-20T08:00:00Z</name>
  <report id="b2"><timestamp>2025-05-20T08:00:00Z</timestamp></report>
</report>
<filters id=""><term>rows=-1</term></filters>
</get_reports_response>"#;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(REPORTS), Some((200, "OK".to_string())));
        let rejected = r#"<delete_target_response status="400" status_text="Target is in use"/>"#;
        assert_eq!(
            parse_status(rejected),
            Some((400, "Target is in use".to_string()))
        );
        assert_eq!(parse_status("Failed to connect"), None);
    }

    #[test]
    fn test_parse_reports_folds_nested_ids() {
        let records = parse_records(REPORTS, "report", &["timestamp", "creation_time"]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a1");
        assert_eq!(
            records[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap())
        );
        assert_eq!(records[1].id, "b2");
        assert_eq!(records[0].name, "2024-01-15T10:30:00Z");
    }

    #[test]
    fn test_record_name_skips_owner() {
        let xml = r#"<get_targets_response status="200" status_text="OK">
<target id="t9"><owner><name>admin</name></owner><name>branch office</name>
<port_list id="p1"><name>All IANA assigned TCP</name></port_list></target>
</get_targets_response>"#;
        let records = parse_records(xml, "target", &["modification_time"]);
        assert_eq!(records[0].name, "branch office");
    }

    /// Answers every call and keeps what the credentials file held at call time
    #[derive(Default)]
    struct InspectingExecutor {
        seen: Mutex<Vec<(CommandSpec, PathBuf, String)>>,
    }

    #[async_trait]
    impl CommandExecutor for InspectingExecutor {
        async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            let argv = spec.argv();
            let idx = argv.iter().position(|a| a == "--config").unwrap();
            let path = PathBuf::from(&argv[idx + 1]);
            let contents = std::fs::read_to_string(&path).unwrap();
            self.seen
                .lock()
                .unwrap()
                .push((spec.clone(), path, contents));
            Ok(CommandOutput::new(
                0,
                r#"<get_reports_response status="200" status_text="OK"/>"#,
                "",
            ))
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.user = "scanner".into();
        config.password = Secret::new("hunter2");
        config
    }

    #[tokio::test]
    async fn test_password_stays_off_the_command_line() {
        let executor = InspectingExecutor::default();
        let runner = CommandRunner::new(&executor, false);
        let config = config();
        let client = GmpClient::new(&runner, &config);
        let mut rec = StepRecorder::start("retention_cleanup", Utc::now());

        client.get_reports(&mut rec).await.unwrap();

        let seen = executor.seen.lock().unwrap();
        let (spec, path, contents) = &seen[0];
        assert!(!spec.argv().iter().any(|a| a.contains("hunter2")));
        assert!(!rec.messages().iter().any(|m| m.contains("hunter2")));
        assert!(contents.contains("[Auth]"));
        assert!(contents.contains("gmp_username=scanner"));
        assert!(contents.contains("gmp_password=hunter2"));
        assert!(!path.exists());

        #[cfg(unix)]
        {
            // Permissions are checked on a file created the same way
            use std::os::unix::fs::PermissionsExt;
            let file = client.credentials_file().unwrap();
            let mode = file.as_file().metadata().unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }
    }

    #[tokio::test]
    async fn test_listings_are_uncapped() {
        let executor = InspectingExecutor::default();
        let runner = CommandRunner::new(&executor, false);
        let config = config();
        let client = GmpClient::new(&runner, &config);
        let mut rec = StepRecorder::start("retention_cleanup", Utc::now());

        client.get_reports(&mut rec).await.unwrap();
        client.get_targets(&mut rec).await.unwrap();
        client.delete_report("r1", &mut rec).await.unwrap();

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].0.output_limit(), None);
        assert_eq!(seen[1].0.output_limit(), None);
        assert_eq!(seen[2].0.output_limit(), Some(MAX_OUTPUT_BYTES));
        assert!(seen[2].0.is_mutating());
    }

    #[tokio::test]
    async fn test_large_listing_is_read_whole() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut xml = String::from(r#"<get_reports_response status="200" status_text="OK">"#);
        for n in 0..200 {
            xml.push_str(&format!(
                r#"<report id="r-{n}"><owner><name>admin</name></owner><name>scan {n}</name>"#
            ));
            xml.push_str(&format!(
                r#"<report id="r-{n}"><timestamp>2020-01-01T00:00:00Z</timestamp>{pad}</report>"#,
                pad = "<result_count><full>0</full></result_count>".repeat(30)
            ));
            xml.push_str("</report>");
        }
        xml.push_str("</get_reports_response>");
        assert!(xml.len() > MAX_OUTPUT_BYTES);
        let path = dir.path().join("reports.xml");
        std::fs::write(&path, &xml).unwrap();

        let spec = CommandSpec::new("cat")
            .arg(path.display().to_string())
            .uncapped();
        let out = ProcessExecutor.execute(&spec).await.unwrap();
        assert!(!out.truncated);

        let records = parse_records(&out.stdout, "report", &["timestamp"]);
        assert_eq!(records.len(), 200);
        assert!(records.iter().all(|r| r.timestamp.is_some()));
    }

    #[test]
    fn test_parse_targets() {
        let xml = r#"<get_targets_response status="200" status_text="OK">
<target id="t1"><name>dmz</name><modification_time>2023-02-01T00:00:00Z</modification_time><in_use>1</in_use></target>
<target id="t2"><name>lab</name><modification_time>2023-03-01T00:00:00+02:00</modification_time><in_use>0</in_use></target>
</get_targets_response>"#;
        let records = parse_records(xml, "target", &["modification_time"]);
        assert_eq!(records.len(), 2);
        assert!(records[0].in_use);
        assert_eq!(records[0].name, "dmz");
        assert!(!records[1].in_use);
        assert_eq!(
            records[1].timestamp,
            Some(Utc.with_ymd_and_hms(2023, 2, 28, 22, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_feeds() {
        let xml = r#"<get_feeds_response status="200" status_text="OK">
<feed><type>NVT</type><name>Greenbone Community Feed</name></feed>
<feed><type>CERT</type><currently_syncing><timestamp>x</timestamp></currently_syncing></feed>
</get_feeds_response>"#;
        let feeds = parse_feeds(xml);
        assert_eq!(
            feeds,
            vec![
                FeedState {
                    feed_type: "NVT".into(),
                    currently_syncing: false
                },
                FeedState {
                    feed_type: "CERT".into(),
                    currently_syncing: true
                },
            ]
        );
    }

    #[test]
    fn test_unparseable_time_is_none() {
        assert!(parse_gmp_time("yesterday").is_none());
    }
}
