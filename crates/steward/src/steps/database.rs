//! PostgreSQL maintenance for the gvmd database
//!
//! A read-only size query doubles as the reachability probe. If it fails the
//! step stops there; otherwise every maintenance operation runs even when an
//! earlier one failed.

use super::{MaintenanceStep, StepContext, DATABASE_OPTIMIZATION};
use crate::runner::CommandSpec;
use async_trait::async_trait;
use steward_common::{MaintenanceError, Result, StepRecorder, StepResult};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct DatabaseOptimizer;

/// One maintenance statement and the key its outcome is recorded under
struct Operation {
    key: &'static str,
    sql: String,
    timeout_secs: u64,
}

impl DatabaseOptimizer {
    pub fn new() -> Self {
        Self
    }

    pub async fn optimize(&self, ctx: &StepContext<'_>, is_dry_run: bool) -> StepResult {
        let mut rec = StepRecorder::start(DATABASE_OPTIMIZATION, ctx.now());
        let database = &ctx.config.platform.database;
        let timeouts = &ctx.config.platform.timeouts;
        rec.detail("database", database.as_str());
        rec.detail("dry_run", is_dry_run);

        let size_before = match self.database_size(ctx, database, &mut rec).await {
            Ok(size) => size,
            Err(e) => {
                rec.fail(format!("database {} unreachable: {}", database, e));
                return rec.finish(ctx.now());
            }
        };
        rec.detail("size_before", size_before.as_str());

        let operations = [
            Operation {
                key: "vacuum_full",
                sql: "VACUUM FULL;".to_string(),
                timeout_secs: timeouts.vacuum,
            },
            Operation {
                key: "analyze",
                sql: "ANALYZE;".to_string(),
                timeout_secs: timeouts.analyze,
            },
            Operation {
                key: "reindex",
                sql: format!("REINDEX DATABASE {};", quote_ident(database)),
                timeout_secs: timeouts.reindex,
            },
        ];

        let mut failed = 0u64;
        for op in &operations {
            info!("Running {} on {}", op.sql, database);
            let spec = psql(database, &op.sql).timeout(op.timeout_secs).mutating();
            let outcome = match ctx.runner.run(&spec, &mut rec).await {
                Ok(output) if output.simulated => "simulated",
                Ok(output) if output.success() => "ok",
                _ => "failed",
            };
            if outcome == "failed" {
                failed += 1;
                warn!("{} failed on {}", op.sql, database);
                rec.fail(format!("{} failed", op.sql.trim_end_matches(';')));
            }
            rec.detail(op.key, outcome);
        }
        rec.detail("operations_failed", failed);

        if is_dry_run {
            rec.message(format!(
                "[dry-run] maintenance of {} simulated, size unchanged",
                database
            ));
        } else {
            match self.database_size(ctx, database, &mut rec).await {
                Ok(size_after) => {
                    rec.message(format!("size {} -> {}", size_before, size_after));
                    rec.detail("size_after", size_after);
                }
                Err(e) => rec.warn(format!("could not read size after maintenance: {}", e)),
            }
        }

        rec.finish(ctx.now())
    }

    async fn database_size(
        &self,
        ctx: &StepContext<'_>,
        database: &str,
        rec: &mut StepRecorder,
    ) -> Result<String> {
        let sql = format!(
            "SELECT pg_size_pretty(pg_database_size({}));",
            quote_literal(database)
        );
        let spec = psql(database, &sql).timeout(ctx.config.platform.timeouts.db_query);
        let output = ctx.runner.run(&spec, rec).await?;
        if !output.success() {
            return Err(MaintenanceError::BackendUnreachable(format!(
                "psql exited with {}",
                output.exit_code
            )));
        }
        let size = output.stdout.trim();
        if size.is_empty() {
            return Err(MaintenanceError::BackendUnreachable(
                "psql returned no size".to_string(),
            ));
        }
        Ok(size.to_string())
    }
}

fn psql(database: &str, sql: &str) -> CommandSpec {
    CommandSpec::new("sudo")
        .args(["-u", "postgres", "psql", "-d", database, "-At", "-c", sql])
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl MaintenanceStep for DatabaseOptimizer {
    fn name(&self) -> &'static str {
        DATABASE_OPTIMIZATION
    }

    fn needs_disk_headroom(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
        Ok(self.optimize(ctx, ctx.mode.dry_run).await)
    }
}
