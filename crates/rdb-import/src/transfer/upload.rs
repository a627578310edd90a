//! Bulk writes of converted rows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, enabled, Level};

use crate::core::value::{Field, Row, TargetValue};
use crate::error::{ImportError, Result};
use crate::target::TargetStore;

/// Writes whole batches to one target path.
///
/// There is no retry here; a failed write fails the batch and the caller
/// decides what that means for the table.
pub struct BatchUploader {
    store: Arc<dyn TargetStore>,
    path: String,
    fields: Vec<Field>,
    counter: Arc<AtomicU64>,
    context: String,
}

impl BatchUploader {
    /// `counter` is advanced by the row count of every successful write.
    /// `context` is prefixed to failure messages.
    pub fn new(
        store: Arc<dyn TargetStore>,
        path: String,
        fields: Vec<Field>,
        counter: Arc<AtomicU64>,
        context: String,
    ) -> Self {
        Self {
            store,
            path,
            fields,
            counter,
            context,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Write `rows` in one call. Empty input is a no-op.
    pub fn upload(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        match self.store.bulk_upsert(&self.path, &self.fields, rows) {
            Ok(()) => {
                self.counter.fetch_add(rows.len() as u64, Ordering::Relaxed);
                debug!("{}: wrote {} rows to {}", self.context, rows.len(), self.path);
                Ok(())
            }
            Err(err) => {
                if enabled!(Level::DEBUG) {
                    self.dump(rows);
                }
                Err(ImportError::upload(
                    &self.path,
                    format!("{}: {}", self.context, err),
                ))
            }
        }
    }

    fn dump(&self, rows: &[Row]) {
        debug!("{}: failed batch of {} rows for {}", self.context, rows.len(), self.path);
        for (n, row) in rows.iter().enumerate() {
            let values: Vec<String> = self
                .fields
                .iter()
                .zip(row)
                .map(|(field, value)| format!("{}={}", field.name, display_value(value)))
                .collect();
            debug!("  #{}: {}", n, values.join(", "));
        }
    }
}

/// Text form of a value for diagnostics. Byte strings are hex encoded.
pub fn display_value(value: &TargetValue) -> String {
    match value {
        TargetValue::Null(_) => "NULL".to_string(),
        TargetValue::Bool(v) => v.to_string(),
        TargetValue::Int32(v) => v.to_string(),
        TargetValue::Int64(v) => v.to_string(),
        TargetValue::Uint32(v) => v.to_string(),
        TargetValue::Uint64(v) => v.to_string(),
        TargetValue::Float(v) => v.to_string(),
        TargetValue::Double(v) => v.to_string(),
        TargetValue::Decimal(v) => v.to_string(),
        TargetValue::Text(v) => format!("{:?}", v),
        TargetValue::Bytes(v) => format!("0x{}", hex::encode(v)),
        TargetValue::Date(v) => v.to_string(),
        TargetValue::Datetime(v) | TargetValue::Timestamp(v) => v.to_string(),
        TargetValue::Uuid(v) => v.to_string(),
    }
}
