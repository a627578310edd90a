//! Target store interface, schema derivation and table creation.
//!
//! The core never talks to a concrete store. Everything it needs is the
//! [`TargetStore`] trait: describe, drop, run a schema script, and bulk
//! write. Failures come back as a structured [`TargetError`] whose nested
//! issues drive the rate-limit retry in [`create`].

pub mod builder;
pub mod create;
pub mod memory;
mod table;

pub use builder::{build_schema, convert_type, BuiltSchema};
pub use create::{CreateTableTask, Sleeper, ThreadSleeper, RATE_LIMIT_MARKER};
pub use memory::MemoryTarget;
pub use table::{blob_fields, TargetTable, SYNTH_KEY_FIELD};

use crate::core::value::{Field, Row};
use crate::error::TargetError;

/// Physical layout of an existing target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub path: String,
    pub fields: Vec<Field>,
    pub primary_key: Vec<String>,
}

/// Operations the pipeline consumes from the target store.
///
/// Calls block the worker thread. Implementations own any session pooling
/// and transient-error retry for [`TargetStore::bulk_upsert`].
pub trait TargetStore: Send + Sync {
    /// Describe a table, `Ok(None)` when the path does not exist.
    fn describe_table(&self, path: &str) -> Result<Option<TableDescription>, TargetError>;

    /// Drop a table.
    fn drop_table(&self, path: &str) -> Result<(), TargetError>;

    /// Execute a schema script such as a `CREATE TABLE` statement.
    fn execute_schema(&self, script: &str) -> Result<(), TargetError>;

    /// Write a batch of rows laid out as `fields`.
    fn bulk_upsert(&self, path: &str, fields: &[Field], rows: &[Row]) -> Result<(), TargetError>;
}
