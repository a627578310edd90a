//! Source database access.
//!
//! The pipeline reads the source through [`SourceCatalog`], a blocking
//! interface each dialect implements with its own catalog SQL. Rows are read
//! through [`RowCursor`], which exposes typed getters the way a result set
//! does: every getter coerces the column's native value to the requested
//! type and returns `Ok(None)` for SQL NULL.

pub mod discovery;
pub mod memory;
pub mod metadata;
pub mod postgres;

pub use discovery::{select_tables, NameMatcher};
pub use memory::{MemorySource, MemoryTable};
pub use metadata::{build_select, read_metadata, zero_rows_query};
pub use postgres::PostgresSource;

use std::io::Read;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use bigdecimal::BigDecimal;
use uuid::Uuid;

use crate::core::schema::{SqlType, TableIdentity};
use crate::error::Result;

/// Result column description harvested from a zero-row probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedColumn {
    pub name: String,
    pub sql_type: SqlType,
    pub precision: i32,
    pub scale: i32,
    pub nullable: bool,
}

impl ProbedColumn {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            precision: 0,
            scale: 0,
            nullable: true,
        }
    }

    pub fn with_precision(mut self, precision: i32, scale: i32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Catalog lookups and query execution for one source dialect.
pub trait SourceCatalog: Send + Sync {
    /// Dialect name for logging.
    fn dialect(&self) -> &str;

    fn list_schemas(&self) -> Result<Vec<String>>;

    fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Column names in declaration order.
    fn grab_column_names(&self, table: &TableIdentity) -> Result<Vec<String>>;

    /// Approximate row count, -1 when unknown.
    fn grab_row_count(&self, table: &TableIdentity) -> Result<i64>;

    /// Primary key column names in key order, empty when there is none.
    /// Dialects may fall back to a unique index under their own policy.
    fn grab_primary_key(&self, table: &TableIdentity) -> Result<Vec<String>>;

    /// Execute a query returning no rows and describe its result columns.
    fn describe_result(&self, sql: &str) -> Result<Vec<ProbedColumn>>;

    /// Quote an identifier for use in generated SQL.
    fn safe_id(&self, id: &str) -> String;

    /// Large-object override for a column the catalog knows more about than
    /// the result metadata shows.
    fn is_large_object(&self, _table: &TableIdentity, _column: &ProbedColumn) -> Option<bool> {
        None
    }

    /// Open a forward-only cursor over a query.
    fn open_cursor(&self, sql: &str) -> Result<Box<dyn RowCursor + '_>>;
}

/// Typed access to the current row. Indexes are 0-based.
pub trait SourceRow {
    fn get_bool(&self, idx: usize) -> Result<Option<bool>>;
    fn get_i32(&self, idx: usize) -> Result<Option<i32>>;
    fn get_i64(&self, idx: usize) -> Result<Option<i64>>;
    fn get_f32(&self, idx: usize) -> Result<Option<f32>>;
    fn get_f64(&self, idx: usize) -> Result<Option<f64>>;
    fn get_decimal(&self, idx: usize) -> Result<Option<BigDecimal>>;
    fn get_string(&self, idx: usize) -> Result<Option<String>>;
    fn get_bytes(&self, idx: usize) -> Result<Option<Vec<u8>>>;
    fn get_date(&self, idx: usize) -> Result<Option<NaiveDate>>;
    fn get_time(&self, idx: usize) -> Result<Option<NaiveTime>>;
    fn get_timestamp(&self, idx: usize) -> Result<Option<NaiveDateTime>>;

    fn get_uuid(&self, idx: usize) -> Result<Option<Uuid>> {
        match self.get_string(idx)? {
            Some(text) => Uuid::parse_str(text.trim())
                .map(Some)
                .map_err(|e| crate::error::ImportError::Value(format!("invalid uuid: {}", e))),
            None => Ok(None),
        }
    }

    /// Stream a large object.
    fn open_blob(&self, idx: usize) -> Result<Option<Box<dyn Read + '_>>>;
}

/// Forward-only cursor over a query result.
pub trait RowCursor: SourceRow {
    /// Move to the next row. `Ok(false)` at the end.
    fn advance(&mut self) -> Result<bool>;

    /// Whether [`SourceRow::get_decimal`] is exact for this driver. When it
    /// is not, decimals are read through their text form.
    fn native_decimals(&self) -> bool {
        true
    }
}
