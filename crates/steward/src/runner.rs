//! Command execution layer
//!
//! Every backend (systemd, feed sync, gvmd, PostgreSQL, openssl) is reached
//! through [`CommandRunner::run`]. The runner:
//! - enforces a per-command timeout and kills the child when it expires
//! - turns mutating commands into simulated successes under dry-run
//! - appends every invocation and its outcome to the calling step's messages
//!
//! The process layer sits behind [`CommandExecutor`] so tests can script
//! responses with [`FakeExecutor`] instead of touching the host.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use steward_common::{MaintenanceError, Result, StepRecorder};
use tracing::{debug, info, warn};

/// Default cap on captured stdout/stderr
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Default timeout for commands
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Length of stderr kept in step messages
const MESSAGE_SNIPPET_CHARS: usize = 200;

/// A command line plus its execution policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    timeout_secs: u64,
    /// `None` captures everything
    output_limit: Option<usize>,
    mutating: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            output_limit: Some(MAX_OUTPUT_BYTES),
            mutating: false,
        }
    }

    /// Build from an argv vector; `None` when it is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program.clone()).args(rest.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Capture the whole output; for listings that are parsed, not just shown
    pub fn uncapped(mut self) -> Self {
        self.output_limit = None;
        self
    }

    /// Mark as changing system state; such commands are only simulated in dry-run
    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn output_limit(&self) -> Option<usize> {
        self.output_limit
    }

    pub fn is_mutating(&self) -> bool {
        self.mutating
    }

    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// True when dry-run skipped execution
    pub simulated: bool,
    /// True when stdout or stderr hit the output limit
    pub truncated: bool,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            simulated: false,
            truncated: false,
        }
    }

    pub fn simulated() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            simulated: true,
            truncated: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Process layer: runs a command to completion or timeout
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Real executor backed by `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let start = Instant::now();
        let child = tokio::process::Command::new(spec.program())
            .args(spec.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MaintenanceError::CommandNotFound {
                        program: spec.program().to_string(),
                    }
                } else {
                    MaintenanceError::Io(e)
                }
            })?;

        // Dropping the wait future on timeout drops the child, which kills it
        let waited = tokio::time::timeout(
            Duration::from_secs(spec.timeout_secs()),
            child.wait_with_output(),
        )
        .await;

        let output = match waited {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Command timed out after {}s: {}",
                    spec.timeout_secs(),
                    spec.display()
                );
                return Err(MaintenanceError::CommandTimeout {
                    command: spec.display(),
                    timeout_secs: spec.timeout_secs(),
                });
            }
        };

        debug!(
            "{} finished in {}ms",
            spec.program(),
            start.elapsed().as_millis()
        );

        let (stdout, stdout_cut) = truncate_output(&output.stdout, spec.output_limit());
        let (stderr, stderr_cut) = truncate_output(&output.stderr, spec.output_limit());

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
            simulated: false,
            truncated: stdout_cut || stderr_cut,
        })
    }
}

/// Step-facing runner: dry-run policy plus message recording
pub struct CommandRunner<'a> {
    executor: &'a dyn CommandExecutor,
    dry_run: bool,
}

impl<'a> CommandRunner<'a> {
    pub fn new(executor: &'a dyn CommandExecutor, dry_run: bool) -> Self {
        Self { executor, dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run `spec`, recording the invocation and outcome on `rec`
    pub async fn run(&self, spec: &CommandSpec, rec: &mut StepRecorder) -> Result<CommandOutput> {
        let shown = spec.display();

        if self.dry_run && spec.is_mutating() {
            info!("[DRY-RUN] Would execute: {}", shown);
            rec.message(format!("[dry-run] {}", shown));
            rec.add_to("simulated_commands", 1);
            return Ok(CommandOutput::simulated());
        }

        debug!(step = rec.step_name(), "Executing: {}", shown);
        match self.executor.execute(spec).await {
            Ok(output) => {
                if !output.stdout.trim().is_empty() {
                    debug!(step = rec.step_name(), "stdout: {}", output.stdout.trim());
                }
                if output.truncated {
                    warn!(step = rec.step_name(), "Output truncated: {}", shown);
                    rec.warn(format!(
                        "{}: output truncated at {} bytes, results may be incomplete",
                        shown,
                        spec.output_limit().unwrap_or(MAX_OUTPUT_BYTES)
                    ));
                }
                if output.success() {
                    rec.message(format!("{} (exit 0)", shown));
                } else {
                    debug!(step = rec.step_name(), "stderr: {}", output.stderr.trim());
                    let stderr = snippet(&output.stderr, MESSAGE_SNIPPET_CHARS);
                    if stderr.is_empty() {
                        rec.message(format!("{} (exit {})", shown, output.exit_code));
                    } else {
                        rec.message(format!(
                            "{} (exit {}): {}",
                            shown, output.exit_code, stderr
                        ));
                    }
                }
                Ok(output)
            }
            Err(e) => {
                rec.message(format!("{} failed: {}", shown, e));
                Err(e)
            }
        }
    }
}

/// First `max_chars` characters of trimmed text
pub fn snippet(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Decode `bytes`, cut to `limit`; the flag reports whether anything was dropped
fn truncate_output(bytes: &[u8], limit: Option<usize>) -> (String, bool) {
    match limit {
        Some(limit) if bytes.len() > limit => {
            (String::from_utf8_lossy(&bytes[..limit]).to_string(), true)
        }
        _ => (String::from_utf8_lossy(bytes).to_string(), false),
    }
}

// ============================================================================
// Fake Executor (Testing)
// ============================================================================

/// Scripted response for [`FakeExecutor`]
#[derive(Debug, Clone)]
pub enum FakeResponse {
    Output(CommandOutput),
    Timeout,
    NotFound,
}

impl FakeResponse {
    pub fn ok(stdout: impl Into<String>) -> Self {
        FakeResponse::Output(CommandOutput::new(0, stdout, ""))
    }

    pub fn exit(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        FakeResponse::Output(CommandOutput::new(code, stdout, stderr))
    }
}

struct FakeRule {
    pattern: String,
    responses: VecDeque<FakeResponse>,
}

/// Executor that answers from a script instead of running anything
///
/// A rule matches when its pattern is a substring of the rendered command
/// line; the first matching rule wins. Each rule hands out its responses in
/// order and keeps repeating the last one. Unmatched commands exit 0 with
/// empty output.
#[derive(Default)]
pub struct FakeExecutor {
    rules: Mutex<Vec<FakeRule>>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, pattern: &str, response: FakeResponse) -> Self {
        self.respond_seq(pattern, vec![response])
    }

    pub fn respond_seq(self, pattern: &str, responses: Vec<FakeResponse>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(FakeRule {
                pattern: pattern.to_string(),
                responses: responses.into(),
            });
        }
        self
    }

    /// Rendered command lines in execution order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }

        let response = {
            let mut rules = self
                .rules
                .lock()
                .map_err(|_| MaintenanceError::Internal("fake executor poisoned".into()))?;
            rules
                .iter_mut()
                .find(|rule| line.contains(&rule.pattern))
                .and_then(|rule| {
                    if rule.responses.len() > 1 {
                        rule.responses.pop_front()
                    } else {
                        rule.responses.front().cloned()
                    }
                })
        };

        match response {
            None => Ok(CommandOutput::new(0, "", "")),
            Some(FakeResponse::Output(output)) => Ok(output),
            Some(FakeResponse::Timeout) => Err(MaintenanceError::CommandTimeout {
                command: line,
                timeout_secs: spec.timeout_secs(),
            }),
            Some(FakeResponse::NotFound) => Err(MaintenanceError::CommandNotFound {
                program: spec.program().to_string(),
            }),
        }
    }
}
