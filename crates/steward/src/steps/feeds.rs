//! Vulnerability feed update
//!
//! Each category's sync command is triggered, then gvmd is polled until it
//! stops reporting that feed as syncing. Categories are independent: one
//! failing category never stops the others.

use super::{MaintenanceStep, StepContext, FEED_UPDATE};
use crate::runner::CommandSpec;
use async_trait::async_trait;
use std::time::Duration;
use steward_common::{FeedSource, MaintenanceError, Result, StepRecorder, StepResult, StepStatus};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct FeedUpdater;

#[derive(Debug, PartialEq, Eq)]
enum FeedOutcome {
    Completed { polls: u32 },
    Simulated,
    Incomplete { polls: u32 },
}

impl FeedUpdater {
    pub fn new() -> Self {
        Self
    }

    pub async fn update(
        &self,
        ctx: &StepContext<'_>,
        feed_categories: &[FeedSource],
    ) -> StepResult {
        let mut rec = StepRecorder::start(FEED_UPDATE, ctx.now());
        let mut succeeded = 0u64;
        let mut failed = 0u64;

        for feed in feed_categories {
            info!("Updating feed {}", feed.category);
            let key = format!("feed_{}", feed.category.to_lowercase());
            match self.sync_category(ctx, feed, &mut rec).await {
                Ok(FeedOutcome::Completed { polls }) => {
                    succeeded += 1;
                    rec.message(format!("{}: updated ({} status polls)", feed.category, polls));
                    rec.detail(key, "ok");
                }
                Ok(FeedOutcome::Simulated) => {
                    succeeded += 1;
                    rec.message(format!("{}: sync simulated", feed.category));
                    rec.detail(key, "simulated");
                }
                Ok(FeedOutcome::Incomplete { polls }) => {
                    failed += 1;
                    warn!("Feed {} still syncing after {} polls", feed.category, polls);
                    rec.message(format!(
                        "{}: sync did not complete after {} status polls",
                        feed.category, polls
                    ));
                    rec.detail(key, "incomplete");
                }
                Err(e) => {
                    failed += 1;
                    warn!("Feed {} failed: {}", feed.category, e);
                    rec.message(format!("{}: {}", feed.category, e));
                    rec.detail(key, "error");
                }
            }
        }

        rec.detail("feeds_updated", succeeded);
        rec.detail("feeds_failed", failed);

        // Partial success degrades the step; only a total failure is an error
        let status = match (succeeded, failed) {
            (_, 0) => StepStatus::Success,
            (0, _) => StepStatus::Error,
            _ => StepStatus::Warning,
        };
        rec.finish_with(status, ctx.now())
    }

    async fn sync_category(
        &self,
        ctx: &StepContext<'_>,
        feed: &FeedSource,
        rec: &mut StepRecorder,
    ) -> Result<FeedOutcome> {
        let spec = CommandSpec::from_argv(&feed.command)
            .ok_or_else(|| {
                MaintenanceError::ConfigInvalid(format!("feed {} has no command", feed.category))
            })?
            .timeout(ctx.config.platform.feed_sync_timeout_secs)
            .mutating();

        let output = ctx.runner.run(&spec, rec).await?;
        if output.simulated {
            return Ok(FeedOutcome::Simulated);
        }
        if !output.success() {
            return Err(MaintenanceError::CommandFailed {
                command: spec.display(),
                exit_code: output.exit_code,
            });
        }

        self.wait_for_completion(ctx, &feed.category, rec).await
    }

    async fn wait_for_completion(
        &self,
        ctx: &StepContext<'_>,
        category: &str,
        rec: &mut StepRecorder,
    ) -> Result<FeedOutcome> {
        let attempts = ctx.config.platform.feed_poll_attempts;
        let interval = Duration::from_secs(ctx.config.platform.feed_poll_interval_secs);
        let gmp = ctx.gmp();

        for poll in 1..=attempts {
            match gmp.get_feeds(rec).await {
                Ok(states) => match states
                    .iter()
                    .find(|s| s.feed_type.eq_ignore_ascii_case(category))
                {
                    Some(state) if !state.currently_syncing => {
                        return Ok(FeedOutcome::Completed { polls: poll });
                    }
                    Some(_) => debug!(
                        "Feed {} still syncing (poll {}/{})",
                        category, poll, attempts
                    ),
                    None => {
                        rec.message(format!("{}: not listed by gvmd, assuming complete", category));
                        return Ok(FeedOutcome::Completed { polls: poll });
                    }
                },
                Err(e) => debug!("Feed status poll {}/{} failed: {}", poll, attempts, e),
            }

            if poll < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Ok(FeedOutcome::Incomplete { polls: attempts })
    }
}

#[async_trait]
impl MaintenanceStep for FeedUpdater {
    fn name(&self) -> &'static str {
        FEED_UPDATE
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
        Ok(self.update(ctx, &ctx.config.platform.feeds).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandRunner, FakeExecutor, FakeResponse};
    use steward_common::{AppConfig, FixedClock, RunMode};

    fn feeds_xml(syncing: &[&str]) -> String {
        let mut xml = String::from(r#"<get_feeds_response status="200" status_text="OK">"#);
        for feed in ["NVT", "GVMD_DATA", "SCAP", "CERT"] {
            xml.push_str(&format!("<feed><type>{}</type>", feed));
            if syncing.contains(&feed) {
                xml.push_str("<currently_syncing><timestamp>now</timestamp></currently_syncing>");
            }
            xml.push_str("</feed>");
        }
        xml.push_str("</get_feeds_response>");
        xml
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.platform.feed_poll_attempts = 3;
        config.platform.feed_poll_interval_secs = 0;
        config
    }

    async fn update(fake: &FakeExecutor, config: &AppConfig, dry_run: bool) -> StepResult {
        let clock = FixedClock::new(chrono::Utc::now());
        let ctx = StepContext {
            config,
            mode: RunMode {
                dry_run,
                ..RunMode::default()
            },
            runner: CommandRunner::new(fake, dry_run),
            clock: &clock,
        };
        FeedUpdater::new().update(&ctx, &config.platform.feeds).await
    }

    #[tokio::test]
    async fn test_all_feeds_complete() {
        let fake = FakeExecutor::new().respond("get_feeds", FakeResponse::ok(feeds_xml(&[])));
        let result = update(&fake, &config(), false).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.detail_u64("feeds_updated"), Some(4));
        assert_eq!(fake.calls_matching("greenbone-nvt-sync"), 1);
        assert_eq!(fake.calls_matching("--type SCAP"), 1);
    }

    #[tokio::test]
    async fn test_polls_until_sync_finishes() {
        let fake = FakeExecutor::new().respond_seq(
            "get_feeds",
            vec![
                FakeResponse::ok(feeds_xml(&["NVT"])),
                FakeResponse::ok(feeds_xml(&["NVT"])),
                FakeResponse::ok(feeds_xml(&[])),
            ],
        );
        let result = update(&fake, &config(), false).await;
        assert_eq!(result.status, StepStatus::Success);
        assert!(result.messages.iter().any(|m| m == "NVT: updated (3 status polls)"));
    }

    #[tokio::test]
    async fn test_one_incomplete_category_is_warning() {
        let fake = FakeExecutor::new().respond("get_feeds", FakeResponse::ok(feeds_xml(&["CERT"])));
        let result = update(&fake, &config(), false).await;
        assert_eq!(result.status, StepStatus::Warning);
        assert_eq!(result.detail("feed_cert").and_then(|v| v.as_str()), Some("incomplete"));
        assert_eq!(result.detail_u64("feeds_failed"), Some(1));
        // NVT, GVMD_DATA, SCAP complete on the first poll, CERT exhausts three
        assert_eq!(fake.calls_matching("get_feeds"), 6);
    }

    #[tokio::test]
    async fn test_all_categories_failing_is_error() {
        let fake = FakeExecutor::new()
            .respond("greenbone", FakeResponse::exit(1, "", "rsync: connection refused"));
        let result = update(&fake, &config(), false).await;
        assert_eq!(result.status, StepStatus::Error);
        assert_eq!(fake.calls_matching("get_feeds"), 0);
    }

    #[tokio::test]
    async fn test_missing_sync_tool_only_fails_that_category() {
        let fake = FakeExecutor::new()
            .respond("greenbone-nvt-sync", FakeResponse::NotFound)
            .respond("get_feeds", FakeResponse::ok(feeds_xml(&[])));
        let result = update(&fake, &config(), false).await;
        assert_eq!(result.status, StepStatus::Warning);
        assert_eq!(result.detail("feed_nvt").and_then(|v| v.as_str()), Some("error"));
        assert_eq!(result.detail_u64("feeds_updated"), Some(3));
    }

    #[tokio::test]
    async fn test_dry_run_simulates_sync() {
        let fake = FakeExecutor::new();
        let result = update(&fake, &config(), true).await;
        assert_eq!(result.status, StepStatus::Success);
        assert!(fake.calls().is_empty());
        assert_eq!(result.detail("feed_scap").and_then(|v| v.as_str()), Some("simulated"));
    }
}
