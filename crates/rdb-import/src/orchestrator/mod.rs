//! Import orchestrator - runs the pipeline stages over all selected tables.
//!
//! Stages run in strict order with a join barrier between them:
//! metadata retrieval, schema build, table creation and data load. A table
//! failing one stage is marked failed and skipped by the later ones.

pub mod pool;

pub use pool::WorkerPool;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{Config, TargetConfig};
use crate::core::TableDecision;
use crate::error::{ImportError, Result};
use crate::source::{read_metadata, select_tables, SourceCatalog};
use crate::target::builder::append_script;
use crate::target::{build_schema, CreateTableTask, Sleeper, TargetStore, ThreadSleeper};
use crate::transfer::{LoadDataTask, LoadSettings, ProgressCounter};

/// What a per-table task hands back to the orchestrator: the decision it
/// worked on and whether the work succeeded.
pub struct TaskOutcome<T> {
    pub decision: TableDecision,
    pub result: Result<T>,
}

/// Counts of one executed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub succeeded: usize,
    pub total: usize,
}

/// A table dropped from the run and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTable {
    pub table: String,
    pub stage: String,
    pub error: String,
}

/// Result of an import run.
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    /// Unique run identifier.
    pub run_id: String,

    /// "completed" or "dry-run".
    pub status: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    /// Candidate tables found by discovery.
    pub tables_total: usize,

    /// Executed stages in order.
    pub stages: Vec<StageSummary>,

    pub failed_tables: Vec<FailedTable>,

    pub rows_written: u64,
    pub blob_chunks_written: u64,
}

impl ImportResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Tables that made it through the last executed stage.
    pub fn tables_succeeded(&self) -> usize {
        self.stages.last().map_or(0, |s| s.succeeded)
    }
}

/// Runs one import from a source catalog into an optional target store.
pub struct Importer {
    config: Arc<Config>,
    source: Arc<dyn SourceCatalog>,
    target: Option<Arc<dyn TargetStore>>,
    sleeper: Arc<dyn Sleeper>,
    dry_run: bool,
}

impl Importer {
    pub fn new(config: Config, source: Arc<dyn SourceCatalog>) -> Self {
        Self {
            config: Arc::new(config),
            source,
            target: None,
            sleeper: Arc::new(ThreadSleeper),
            dry_run: false,
        }
    }

    /// Target store to create tables in and load.
    pub fn with_target(mut self, target: Arc<dyn TargetStore>) -> Self {
        self.target = Some(target);
        self
    }

    /// Replace the sleeper used by the rate-limit backoff.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Stop after the schema stage even when a target is configured.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run every stage. Per-table failures are recorded in the result; an
    /// error means the run as a whole could not proceed.
    pub async fn run(self) -> Result<ImportResult> {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let pool = WorkerPool::new(self.config.workers.get_pool_size());
        let target_config = self.config.target.clone().unwrap_or_default();
        let store = match (&self.target, self.dry_run || self.config.is_dry_run()) {
            (Some(store), false) => Some(Arc::clone(store)),
            _ => None,
        };
        let status = if store.is_some() { "completed" } else { "dry-run" };

        info!("Starting import run: {}", run_id);
        info!("Using {} workers", pool.size());

        let config = Arc::clone(&self.config);
        let source = Arc::clone(&self.source);
        let mut decisions = tokio::task::spawn_blocking(move || select_tables(&config, source.as_ref()))
            .await
            .map_err(|e| ImportError::pool(e, "running table discovery"))??;
        let tables_total = decisions.len();

        let mut run = RunLog::default();
        let progress = Arc::new(ProgressCounter::new());

        if tables_total == 0 {
            warn!("No tables selected, nothing to do");
        } else {
            let source = Arc::clone(&self.source);
            run.stage(
                &pool,
                "metadata",
                &mut decisions,
                move |decision| {
                    let metadata = read_metadata(
                        source.as_ref(),
                        &decision.identity,
                        decision.table_ref.as_ref(),
                    )?;
                    decision.metadata = Some(metadata);
                    Ok(())
                },
            )
            .await?;

            run.schema_stage(&mut decisions, &target_config);
            if let Some(path) = &target_config.script_file {
                write_script(path, &decisions)?;
            }

            if let Some(store) = store {
                let create = CreateTableTask::new(
                    Arc::clone(&store),
                    Arc::clone(&self.sleeper),
                    target_config.replace_existing,
                );
                run.stage(&pool, "create", &mut decisions, move |decision| {
                    create_tables(&create, decision)
                })
                .await?;

                if target_config.load_data {
                    let load = LoadDataTask::new(
                        Arc::clone(&self.source),
                        store,
                        LoadSettings::from_config(&target_config),
                        Arc::clone(&progress),
                    );
                    let reporter = progress.start_reporter();
                    let load_started = Instant::now();
                    let stage = run
                        .stage(&pool, "load", &mut decisions, move |decision| load.run(decision))
                        .await;
                    reporter.abort();
                    stage?;
                    progress.log_summary(load_started);
                }
            }
        }
        pool.shutdown();

        let (_, rows_written, blob_chunks_written) = progress.snapshot();
        let completed_at = Utc::now();
        let result = ImportResult {
            run_id,
            status: status.to_string(),
            started_at,
            completed_at,
            duration_seconds: started.elapsed().as_secs_f64(),
            tables_total,
            stages: run.stages,
            failed_tables: run.failed,
            rows_written,
            blob_chunks_written,
        };

        info!(
            "Import {}: {} of {} tables, {} rows in {:.1}s",
            result.status,
            result.tables_succeeded(),
            result.tables_total,
            result.rows_written,
            result.duration_seconds
        );

        if tables_total > 0 && result.tables_succeeded() == 0 {
            return Err(ImportError::NoTablesSucceeded(tables_total));
        }
        Ok(result)
    }
}

/// Stage counts and failures collected over a run.
#[derive(Default)]
struct RunLog {
    stages: Vec<StageSummary>,
    failed: Vec<FailedTable>,
}

impl RunLog {
    fn fail(&mut self, decision: &mut TableDecision, stage: &str, err: &ImportError) {
        error!("{}: {} failed: {}", decision.identity, stage, err);
        decision.failed = true;
        self.failed.push(FailedTable {
            table: decision.identity.full_name(),
            stage: stage.to_string(),
            error: err.to_string(),
        });
    }

    fn finish(&mut self, stage: &str, succeeded: usize, total: usize) {
        info!("{}: completed {} of {}", stage, succeeded, total);
        self.stages.push(StageSummary {
            stage: stage.to_string(),
            succeeded,
            total,
        });
    }

    /// Run `task` on the worker pool for every table still in the run and
    /// wait for all of them.
    async fn stage<T, F>(
        &mut self,
        pool: &WorkerPool,
        stage: &str,
        decisions: &mut Vec<TableDecision>,
        task: F,
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&mut TableDecision) -> Result<T> + Send + Sync + 'static,
    {
        let mut slots: Vec<Option<TableDecision>> = Vec::with_capacity(decisions.len());
        let mut active = Vec::new();
        for (idx, decision) in std::mem::take(decisions).into_iter().enumerate() {
            if decision.failed {
                slots.push(Some(decision));
            } else {
                slots.push(None);
                active.push((idx, decision));
            }
        }
        let total = active.len();

        let outcomes = pool
            .run_all(active, move |(idx, mut decision)| {
                let result = task(&mut decision);
                (idx, TaskOutcome { decision, result })
            })
            .await?;

        let mut values = Vec::with_capacity(total);
        for (idx, outcome) in outcomes {
            let mut decision = outcome.decision;
            match outcome.result {
                Ok(value) => values.push(value),
                Err(err) => self.fail(&mut decision, stage, &err),
            }
            slots[idx] = Some(decision);
        }
        *decisions = slots.into_iter().flatten().collect();
        self.finish(stage, values.len(), total);
        Ok(values)
    }

    /// Build target layouts on the calling thread.
    fn schema_stage(&mut self, decisions: &mut [TableDecision], target: &TargetConfig) {
        let mut total = 0;
        let mut succeeded = 0;
        for decision in decisions.iter_mut().filter(|d| !d.failed) {
            total += 1;
            match build_schema(decision, target) {
                Ok(Some(built)) => {
                    decision.target = Some(built.main);
                    decision.blob_targets = built.blobs;
                    succeeded += 1;
                }
                Ok(None) => {
                    warn!("{}: no column has a usable type, skipping", decision.identity);
                    let err = ImportError::schema(decision.identity.full_name(), "no usable columns");
                    self.fail(decision, "schema", &err);
                }
                Err(err) => self.fail(decision, "schema", &err),
            }
        }
        self.finish("schema", succeeded, total);
    }
}

/// Create the main table and every chunk table of one decision, adopting
/// the layout of tables that are kept.
fn create_tables(task: &CreateTableTask, decision: &mut TableDecision) -> Result<()> {
    let Some(main) = decision.target.as_mut() else {
        return Err(ImportError::schema(
            decision.identity.full_name(),
            "target layout has not been built",
        ));
    };
    if let Some(existing) = task.run(main)? {
        main.reconcile(&existing)?;
    }
    for (_, blob) in decision.blob_targets.iter_mut() {
        if let Some(existing) = task.run(blob)? {
            blob.reconcile(&existing)?;
        }
    }
    Ok(())
}

/// Write the DDL of every built table, chunk tables after their main table.
fn write_script(path: &Path, decisions: &[TableDecision]) -> Result<()> {
    let mut script = String::new();
    let mut count = 0;
    for decision in decisions.iter().filter(|d| !d.failed) {
        let Some(main) = &decision.target else {
            continue;
        };
        append_script(&mut script, main);
        for (_, blob) in &decision.blob_targets {
            append_script(&mut script, blob);
        }
        count += 1;
    }
    std::fs::write(path, script)?;
    info!("Wrote DDL script for {} tables to {}", count, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::SqlType;
    use crate::core::value::SourceValue;
    use crate::error::{Issue, StatusCode, TargetError};
    use crate::source::{MemorySource, MemoryTable, ProbedColumn};
    use crate::target::MemoryTarget;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    fn config(target: bool) -> Config {
        let mut yaml = String::from(
            "source:\n  host: h\n  database: d\n  user: u\nworkers:\n  pool_size: 2\ntable_maps:\n  - include_schemas: [public]\n",
        );
        if target {
            yaml.push_str("target:\n  database: db\n  max_batch_rows: 2\n");
        }
        Config::from_yaml(&yaml).unwrap()
    }

    fn users() -> MemoryTable {
        MemoryTable::new("public", "users")
            .column(ProbedColumn::new("id", SqlType::Integer).not_null())
            .column(ProbedColumn::new("name", SqlType::VarChar))
            .primary_key(&["id"])
            .row(vec![SourceValue::Int(1), "ann".into()])
            .row(vec![SourceValue::Int(2), "bob".into()])
            .row(vec![SourceValue::Int(3), SourceValue::Null])
    }

    fn events() -> MemoryTable {
        MemoryTable::new("public", "events")
            .column(ProbedColumn::new("kind", SqlType::VarChar))
            .row(vec!["a".into()])
    }

    #[tokio::test]
    async fn test_full_run_loads_every_table() {
        let source = Arc::new(MemorySource::new().with_table(users()).with_table(events()));
        let store = Arc::new(MemoryTarget::new());
        let result = Importer::new(config(true), source)
            .with_target(store.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.tables_total, 2);
        let stages: Vec<(&str, usize, usize)> = result
            .stages
            .iter()
            .map(|s| (s.stage.as_str(), s.succeeded, s.total))
            .collect();
        assert_eq!(
            stages,
            [("metadata", 2, 2), ("schema", 2, 2), ("create", 2, 2), ("load", 2, 2)]
        );
        assert_eq!(result.rows_written, 4);
        assert_eq!(store.upload_sizes("db/public/users"), vec![2, 1]);
        assert_eq!(store.rows("db/public/events").len(), 1);
        assert!(result.failed_tables.is_empty());
    }

    #[tokio::test]
    async fn test_failed_table_does_not_stop_the_others() {
        let source = Arc::new(
            MemorySource::new()
                .with_table(users())
                .with_table(events())
                .with_failing_table(crate::core::TableIdentity::new("public", "events")),
        );
        let store = Arc::new(MemoryTarget::new());
        let result = Importer::new(config(true), source)
            .with_target(store.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(result.stages[0].succeeded, 1);
        assert_eq!(result.stages[0].total, 2);
        // later stages only see the surviving table
        assert_eq!(result.stages[3].total, 1);
        assert_eq!(result.failed_tables.len(), 1);
        assert_eq!(result.failed_tables[0].table, "public.events");
        assert_eq!(result.failed_tables[0].stage, "metadata");
        assert_eq!(store.table_paths(), vec!["db/public/users".to_string()]);
    }

    #[tokio::test]
    async fn test_no_surviving_table_fails_the_run() {
        let source = Arc::new(
            MemorySource::new()
                .with_table(users())
                .with_failing_table(crate::core::TableIdentity::new("public", "users")),
        );
        let err = Importer::new(config(true), source)
            .with_target(Arc::new(MemoryTarget::new()))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::NoTablesSucceeded(1)));
    }

    #[tokio::test]
    async fn test_dry_run_stops_after_schema() {
        let source = Arc::new(MemorySource::new().with_table(users()));
        let store = Arc::new(MemoryTarget::new());
        let result = Importer::new(config(true), source)
            .with_target(store.clone())
            .dry_run(true)
            .run()
            .await
            .unwrap();
        assert_eq!(result.status, "dry-run");
        assert_eq!(result.stages.len(), 2);
        assert!(store.table_paths().is_empty());
    }

    #[tokio::test]
    async fn test_missing_target_section_is_a_dry_run() {
        let source = Arc::new(MemorySource::new().with_table(users()));
        let result = Importer::new(config(false), source).run().await.unwrap();
        assert_eq!(result.status, "dry-run");
        assert_eq!(result.tables_succeeded(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_create_is_retried() {
        let source = Arc::new(MemorySource::new().with_table(users()));
        let store = Arc::new(MemoryTarget::new());
        let limit = || {
            TargetError::new(
                StatusCode::Overloaded,
                vec![Issue::new("failed")
                    .with_child(Issue::new("Request exceeded a limit on schema operations"))],
            )
        };
        store.fail_next_schema_ops(vec![limit(), limit()]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let result = Importer::new(config(true), source)
            .with_target(store.clone())
            .with_sleeper(sleeper.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(result.stages[2].succeeded, 1);
        assert_eq!(sleeper.sleeps.lock().unwrap().len(), 2);
        assert_eq!(store.rows("db/public/users").len(), 3);
    }

    #[tokio::test]
    async fn test_existing_table_is_kept_and_loaded() {
        let source = Arc::new(MemorySource::new().with_table(users()));
        let store = Arc::new(MemoryTarget::new());
        let first = Importer::new(config(true), source.clone())
            .with_target(store.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(first.rows_written, 3);

        let second = Importer::new(config(true), source)
            .with_target(store.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(second.stages[2].succeeded, 1);
        assert_eq!(store.drop_count(), 0);
        assert_eq!(store.scripts().len(), 1);
    }

    #[tokio::test]
    async fn test_result_serializes() {
        let source = Arc::new(MemorySource::new().with_table(users()));
        let result = Importer::new(config(false), source).run().await.unwrap();
        let json = result.to_json().unwrap();
        assert!(json.contains("\"status\": \"dry-run\""));
        assert!(json.contains("\"stage\": \"metadata\""));
    }
}
