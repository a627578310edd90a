//! Table data load.
//!
//! A load reads one table through a forward-only cursor, converts every row
//! into the target layout and writes it in batches. Large objects go to
//! their chunk tables through one [`BlobSaver`] per column. Row order within
//! a table is kept from cursor to upload.

pub mod progress;
pub mod upload;

pub use progress::ProgressCounter;
pub use upload::BatchUploader;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::convert::{select_reader, BlobSaver, Reader, SynthKey};
use crate::core::schema::ColumnInfo;
use crate::core::value::{Row, TargetValue};
use crate::core::TableDecision;
use crate::error::{ImportError, Result};
use crate::source::{RowCursor, SourceCatalog};
use crate::target::{TargetStore, TargetTable};

/// Batch thresholds for a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSettings {
    pub max_batch_rows: usize,
    pub max_blob_rows: usize,
}

impl LoadSettings {
    pub fn from_config(target: &TargetConfig) -> Self {
        Self {
            max_batch_rows: target.max_batch_rows.max(1),
            max_blob_rows: target.get_max_blob_rows(),
        }
    }
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self::from_config(&TargetConfig::default())
    }
}

/// Totals of one finished table load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: u64,
    pub blobs: u64,
}

enum Conversion {
    Value(Reader),
    /// Index into the load's blob savers.
    Blob(usize),
}

/// How one source column lands in the target row.
struct Binding {
    source_idx: usize,
    target_pos: usize,
    column: String,
    conversion: Conversion,
}

/// Copies tables from the source to the target store.
pub struct LoadDataTask {
    source: Arc<dyn SourceCatalog>,
    store: Arc<dyn TargetStore>,
    settings: LoadSettings,
    progress: Arc<ProgressCounter>,
}

impl LoadDataTask {
    pub fn new(
        source: Arc<dyn SourceCatalog>,
        store: Arc<dyn TargetStore>,
        settings: LoadSettings,
        progress: Arc<ProgressCounter>,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            progress,
        }
    }

    /// Load one table. Any failure aborts the table; nothing is retried.
    pub fn run(&self, decision: &TableDecision) -> Result<LoadStats> {
        let name = decision.identity.full_name();
        let (Some(metadata), Some(target)) = (&decision.metadata, &decision.target) else {
            return Err(ImportError::schema(&name, "table has no metadata or target layout"));
        };
        let started = Instant::now();
        info!("{}: loading into {}", name, target.path);

        let mut cursor = self.source.open_cursor(&metadata.query)?;
        let mut savers = Vec::new();
        let bindings = self.bind(decision, target, metadata.columns(), cursor.native_decimals(), &mut savers)?;

        let main = BatchUploader::new(
            Arc::clone(&self.store),
            target.path.clone(),
            target.fields().to_vec(),
            Arc::clone(&self.progress.rows_written),
            name.clone(),
        );
        let mut batch: Vec<Row> = Vec::with_capacity(self.settings.max_batch_rows);
        let mut stats = LoadStats::default();

        while cursor.advance()? {
            self.progress.rows_read.fetch_add(1, Ordering::Relaxed);
            let row = convert_row(cursor.as_ref(), target, &bindings, &mut savers, &mut stats)?;
            batch.push(row);
            stats.rows += 1;
            if batch.len() >= self.settings.max_batch_rows {
                main.upload(&batch)?;
                batch.clear();
            }
        }

        main.upload(&batch)?;
        for saver in &mut savers {
            saver.flush()?;
        }

        info!(
            "{}: loaded {} rows, {} large objects in {:.1}s",
            name,
            stats.rows,
            stats.blobs,
            started.elapsed().as_secs_f64()
        );
        Ok(stats)
    }

    /// Resolve the conversion of every column once, ordered by source
    /// position.
    fn bind(
        &self,
        decision: &TableDecision,
        target: &TargetTable,
        columns: &[ColumnInfo],
        native_decimals: bool,
        savers: &mut Vec<BlobSaver>,
    ) -> Result<Vec<Binding>> {
        let name = decision.identity.full_name();
        let mut bindings = Vec::with_capacity(columns.len());

        for (source_idx, column) in columns.iter().enumerate() {
            let Some(target_pos) = target.field_index(column.destination_name()) else {
                warn!(
                    "{}: source column {} has no target field, skipping it",
                    name,
                    column.name()
                );
                continue;
            };

            let conversion = if column.is_blob() {
                let blob_table = decision.blob_target(column.name()).ok_or_else(|| {
                    ImportError::schema(
                        &name,
                        format!("no chunk table for large object column {}", column.name()),
                    )
                })?;
                let uploader = BatchUploader::new(
                    Arc::clone(&self.store),
                    blob_table.path.clone(),
                    blob_table.fields().to_vec(),
                    Arc::clone(&self.progress.blob_chunks),
                    format!("{} column {}", name, column.name()),
                );
                savers.push(BlobSaver::new(uploader, self.settings.max_blob_rows));
                Conversion::Blob(savers.len() - 1)
            } else {
                let ty = target.fields()[target_pos].ty;
                let reader = select_reader(ty, column.sql_type, native_decimals).ok_or_else(|| {
                    ImportError::conversion(
                        column.name(),
                        format!("cannot convert {} to {}", column.sql_type, ty),
                    )
                })?;
                debug!("{}: column {} read as {:?}", name, column.name(), reader.mode);
                Conversion::Value(reader)
            };

            bindings.push(Binding {
                source_idx,
                target_pos,
                column: column.name().to_string(),
                conversion,
            });
        }

        for (pos, field) in target.fields().iter().enumerate() {
            if Some(pos) == target.synth_key_pos() {
                continue;
            }
            if !bindings.iter().any(|b| b.target_pos == pos) {
                warn!(
                    "{}: target field {} has no source column, loading NULL",
                    name, field.name
                );
            }
        }

        bindings.sort_by_key(|b| b.source_idx);
        Ok(bindings)
    }
}

fn convert_row(
    cursor: &dyn RowCursor,
    target: &TargetTable,
    bindings: &[Binding],
    savers: &mut [BlobSaver],
    stats: &mut LoadStats,
) -> Result<Row> {
    let mut row: Row = target
        .fields()
        .iter()
        .map(|f| TargetValue::Null(f.ty))
        .collect();
    let mut key = target.synth_key_pos().map(|_| SynthKey::new());

    for binding in bindings {
        let value = match &binding.conversion {
            Conversion::Value(reader) => reader
                .read(cursor, binding.source_idx, key.as_mut())
                .map_err(|e| ImportError::conversion(&binding.column, e))?,
            Conversion::Blob(n) => {
                let saver = &mut savers[*n];
                save_blob(cursor, binding, saver, key.as_mut(), stats)?
            }
        };
        row[binding.target_pos] = value;
    }

    if let (Some(pos), Some(key)) = (target.synth_key_pos(), key) {
        row[pos] = TargetValue::Text(key.build());
    }
    Ok(row)
}

fn save_blob(
    cursor: &dyn RowCursor,
    binding: &Binding,
    saver: &mut BlobSaver,
    key: Option<&mut SynthKey>,
    stats: &mut LoadStats,
) -> Result<TargetValue> {
    let stream = cursor
        .open_blob(binding.source_idx)
        .map_err(|e| ImportError::conversion(&binding.column, e))?;
    let Some(mut stream) = stream else {
        if let Some(key) = key {
            key.put_null();
        }
        return Ok(TargetValue::Null(crate::core::value::TargetType::Int64));
    };
    let id = saver.next_id();
    if let Some(key) = key {
        key.put_i64(id);
    }
    saver.save_blob(id, &mut stream).map_err(|e| match e {
        ImportError::Upload { .. } => e,
        other => ImportError::conversion(&binding.column, other),
    })?;
    stats.blobs += 1;
    Ok(TargetValue::Int64(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableOptions;
    use crate::core::schema::{SqlType, TableIdentity};
    use crate::core::value::{SourceValue, TargetType};
    use crate::source::{read_metadata, MemorySource, MemoryTable, ProbedColumn};
    use crate::target::{build_schema, MemoryTarget};
    use crate::error::{StatusCode, TargetError};

    fn settings(max_batch_rows: usize) -> LoadSettings {
        LoadSettings {
            max_batch_rows,
            max_blob_rows: 100,
        }
    }

    fn people(rows: usize) -> MemoryTable {
        let mut table = MemoryTable::new("public", "people")
            .column(ProbedColumn::new("id", SqlType::Integer).not_null())
            .column(ProbedColumn::new("name", SqlType::VarChar))
            .primary_key(&["id"]);
        for i in 0..rows {
            table = table.row(vec![SourceValue::Int(i as i64), format!("p{}", i).into()]);
        }
        table
    }

    /// Run discovery-free metadata and schema stages for one table.
    fn prepare(source: &MemorySource, store: &MemoryTarget, schema: &str, table: &str) -> TableDecision {
        let identity = TableIdentity::new(schema, table);
        let mut decision =
            TableDecision::new(identity.clone(), Arc::new(TableOptions::default()), None);
        decision.metadata = Some(read_metadata(source, &identity, None).unwrap());
        let built = build_schema(&decision, &TargetConfig::default())
            .unwrap()
            .unwrap();
        store.execute_schema(&built.main.ddl).unwrap();
        for (_, blob) in &built.blobs {
            store.execute_schema(&blob.ddl).unwrap();
        }
        decision.target = Some(built.main);
        decision.blob_targets = built.blobs;
        decision
    }

    fn task(source: Arc<MemorySource>, store: Arc<MemoryTarget>, batch: usize) -> LoadDataTask {
        LoadDataTask::new(source, store, settings(batch), Arc::new(ProgressCounter::new()))
    }

    #[test]
    fn test_batches_split_at_threshold() {
        let source = Arc::new(MemorySource::new().with_table(people(7)));
        let store = Arc::new(MemoryTarget::new());
        let decision = prepare(&source, &store, "public", "people");
        let stats = task(source, store.clone(), 3).run(&decision).unwrap();
        assert_eq!(stats.rows, 7);
        assert_eq!(store.upload_sizes("public/people"), vec![3, 3, 1]);
    }

    #[test]
    fn test_exact_batch_has_no_trailing_write() {
        let source = Arc::new(MemorySource::new().with_table(people(3)));
        let store = Arc::new(MemoryTarget::new());
        let decision = prepare(&source, &store, "public", "people");
        task(source, store.clone(), 3).run(&decision).unwrap();
        assert_eq!(store.upload_sizes("public/people"), vec![3]);
    }

    #[test]
    fn test_rows_keep_cursor_order() {
        let source = Arc::new(MemorySource::new().with_table(people(5)));
        let store = Arc::new(MemoryTarget::new());
        let decision = prepare(&source, &store, "public", "people");
        task(source, store.clone(), 2).run(&decision).unwrap();
        let ids: Vec<i32> = store
            .rows("public/people")
            .iter()
            .map(|r| r[0].as_i32().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_keyless_rows_get_stable_keys() {
        let table = MemoryTable::new("public", "log")
            .column(ProbedColumn::new("msg", SqlType::VarChar))
            .row(vec!["a".into()])
            .row(vec!["b".into()])
            .row(vec!["a".into()]);
        let source = Arc::new(MemorySource::new().with_table(table));
        let store = Arc::new(MemoryTarget::new());
        let decision = prepare(&source, &store, "public", "log");
        task(source, store.clone(), 10).run(&decision).unwrap();

        let rows = store.rows("public/log");
        let pos = decision.target.as_ref().unwrap().synth_key_pos().unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r[pos].as_str().unwrap()).collect();
        assert_eq!(keys[0], keys[2]);
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn test_missing_source_column_loads_null() {
        let source = Arc::new(MemorySource::new().with_table(people(1)));
        let store = Arc::new(MemoryTarget::new());
        let mut decision = prepare(&source, &store, "public", "people");
        // the target knows a field the source does not have
        let mut target = decision.target.take().unwrap();
        let mut fields = target.fields().to_vec();
        fields.push(crate::core::value::Field::new("extra", TargetType::Text, true));
        target = TargetTable::new(target.owner.clone(), target.path.clone(), target.ddl.clone(), fields);
        decision.target = Some(target);

        let store_fields = store.table("public/people").unwrap();
        assert_eq!(store_fields.fields.len(), 2);
        // the memory store checks row width against the fields passed in
        task(source, store.clone(), 10).run(&decision).unwrap();
        let rows = store.rows("public/people");
        assert_eq!(rows[0][2], TargetValue::Null(TargetType::Text));
    }

    #[test]
    fn test_unconvertible_column_fails_before_reading() {
        let source = Arc::new(MemorySource::new().with_table(people(2)));
        let store = Arc::new(MemoryTarget::new());
        let mut decision = prepare(&source, &store, "public", "people");
        let target = decision.target.take().unwrap();
        let mut fields = target.fields().to_vec();
        fields[1].ty = TargetType::Date;
        decision.target = Some(TargetTable::new(
            target.owner.clone(),
            target.path.clone(),
            target.ddl.clone(),
            fields,
        ));
        let err = task(source, store.clone(), 10).run(&decision).unwrap_err();
        assert!(matches!(err, ImportError::Conversion { ref column, .. } if column == "name"));
        assert!(store.rows("public/people").is_empty());
    }

    #[test]
    fn test_bad_value_names_the_column() {
        let table = MemoryTable::new("public", "nums")
            .column(ProbedColumn::new("n", SqlType::Integer).not_null())
            .primary_key(&["n"])
            .row(vec!["not a number".into()]);
        let source = Arc::new(MemorySource::new().with_table(table));
        let store = Arc::new(MemoryTarget::new());
        let decision = prepare(&source, &store, "public", "nums");
        let err = task(source, store, 10).run(&decision).unwrap_err();
        assert!(err.to_string().starts_with("Failed conversion for column n"));
    }

    #[test]
    fn test_upload_failure_fails_the_table() {
        let source = Arc::new(MemorySource::new().with_table(people(4)));
        let store = Arc::new(MemoryTarget::new());
        let decision = prepare(&source, &store, "public", "people");
        store.fail_uploads("public/people", TargetError::message(StatusCode::Overloaded, "busy"));
        let err = task(source, store, 2).run(&decision).unwrap_err();
        assert!(matches!(err, ImportError::Upload { .. }));
    }

    #[test]
    fn test_blob_without_chunk_table_fails() {
        let table = MemoryTable::new("public", "docs")
            .column(ProbedColumn::new("id", SqlType::Integer).not_null())
            .column(ProbedColumn::new("body", SqlType::Blob))
            .primary_key(&["id"])
            .row(vec![SourceValue::Int(1), vec![1u8, 2, 3].into()]);
        let source = Arc::new(MemorySource::new().with_table(table));
        let store = Arc::new(MemoryTarget::new());
        let mut decision = prepare(&source, &store, "public", "docs");
        decision.blob_targets.clear();
        let err = task(source, store, 10).run(&decision).unwrap_err();
        assert!(matches!(err, ImportError::Schema { .. }));
    }

    #[test]
    fn test_blobs_are_chunked_and_null_blobs_have_no_id() {
        let table = MemoryTable::new("public", "docs")
            .column(ProbedColumn::new("id", SqlType::Integer).not_null())
            .column(ProbedColumn::new("body", SqlType::Blob))
            .primary_key(&["id"])
            .row(vec![SourceValue::Int(1), vec![9u8; 70_000].into()])
            .row(vec![SourceValue::Int(2), SourceValue::Null]);
        let source = Arc::new(MemorySource::new().with_table(table));
        let store = Arc::new(MemoryTarget::new());
        let decision = prepare(&source, &store, "public", "docs");
        let progress = Arc::new(ProgressCounter::new());
        let stats = LoadDataTask::new(source, store.clone(), settings(10), progress.clone())
            .run(&decision)
            .unwrap();

        assert_eq!(stats, LoadStats { rows: 2, blobs: 1 });
        let rows = store.rows("public/docs");
        assert_eq!(rows[0][1], TargetValue::Int64(1));
        assert_eq!(rows[1][1], TargetValue::Null(TargetType::Int64));
        assert_eq!(store.rows("public/docs_body").len(), 2);
        assert_eq!(progress.snapshot(), (2, 2, 2));
    }
}
