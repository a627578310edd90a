//! In-memory source catalog.
//!
//! Tables are declared with their probed column types and rows of
//! [`SourceValue`]s. Getters coerce between compatible representations the
//! way a result set does, so the conversion engine sees the same behavior
//! as against a real driver.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::str::FromStr;

use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use crate::core::schema::TableIdentity;
use crate::core::value::SourceValue;
use crate::error::{ImportError, Result};
use crate::source::metadata::{ZERO_ROWS_PREFIX, ZERO_ROWS_SUFFIX};
use crate::source::{ProbedColumn, RowCursor, SourceCatalog, SourceRow};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// One declared table or query result.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    pub identity: TableIdentity,
    pub columns: Vec<ProbedColumn>,
    pub primary_key: Vec<String>,
    pub rows: Vec<Vec<SourceValue>>,
    large_objects: BTreeSet<String>,
}

impl MemoryTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            identity: TableIdentity::new(schema, table),
            columns: Vec::new(),
            primary_key: Vec::new(),
            rows: Vec::new(),
            large_objects: BTreeSet::new(),
        }
    }

    pub fn column(mut self, column: ProbedColumn) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn row(mut self, values: Vec<SourceValue>) -> Self {
        self.rows.push(values);
        self
    }

    /// Mark a column as a large object regardless of its declared type.
    pub fn large_object(mut self, column: &str) -> Self {
        self.large_objects.insert(column.to_string());
        self
    }
}

/// Source catalog backed by declared tables.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    tables: BTreeMap<TableIdentity, MemoryTable>,
    queries: Vec<(String, MemoryTable)>,
    failing: BTreeSet<TableIdentity>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: MemoryTable) -> Self {
        self.tables.insert(table.identity.clone(), table);
        self
    }

    /// Register the result of a custom query text.
    pub fn with_query(mut self, sql: impl Into<String>, result: MemoryTable) -> Self {
        self.queries.push((sql.into().trim().to_string(), result));
        self
    }

    /// Make every catalog lookup of `identity` fail.
    pub fn with_failing_table(mut self, identity: TableIdentity) -> Self {
        self.failing.insert(identity);
        self
    }

    fn table(&self, identity: &TableIdentity) -> Result<&MemoryTable> {
        if self.failing.contains(identity) {
            return Err(ImportError::Catalog(format!(
                "lookup of {} failed",
                identity.full_name()
            )));
        }
        self.tables
            .get(identity)
            .ok_or_else(|| ImportError::Catalog(format!("no such table: {}", identity)))
    }

    /// Find the declared result a query reads.
    fn resolve(&self, sql: &str) -> Result<&MemoryTable> {
        let mut sql = sql.trim();
        if let Some(inner) = sql
            .strip_prefix(ZERO_ROWS_PREFIX)
            .and_then(|rest| rest.strip_suffix(ZERO_ROWS_SUFFIX))
        {
            sql = inner.trim();
        }
        if let Some((_, table)) = self.queries.iter().find(|(q, _)| q == sql) {
            return Ok(table);
        }
        let found = self.tables.values().find(|t| {
            let from = format!(
                " FROM {}.{}",
                self.safe_id(&t.identity.schema),
                self.safe_id(&t.identity.table)
            );
            sql.ends_with(&from)
        });
        match found {
            Some(table) if self.failing.contains(&table.identity) => Err(ImportError::Catalog(
                format!("query on {} failed", table.identity),
            )),
            Some(table) => Ok(table),
            None => Err(ImportError::Catalog(format!("cannot execute: {}", sql))),
        }
    }
}

impl SourceCatalog for MemorySource {
    fn dialect(&self) -> &str {
        "memory"
    }

    fn list_schemas(&self) -> Result<Vec<String>> {
        let schemas: BTreeSet<&str> = self.tables.keys().map(|t| t.schema.as_str()).collect();
        Ok(schemas.into_iter().map(String::from).collect())
    }

    fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .keys()
            .filter(|t| t.schema == schema)
            .map(|t| t.table.clone())
            .collect())
    }

    fn grab_column_names(&self, table: &TableIdentity) -> Result<Vec<String>> {
        Ok(self
            .table(table)?
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    fn grab_row_count(&self, table: &TableIdentity) -> Result<i64> {
        Ok(self.table(table)?.rows.len() as i64)
    }

    fn grab_primary_key(&self, table: &TableIdentity) -> Result<Vec<String>> {
        Ok(self.table(table)?.primary_key.clone())
    }

    fn describe_result(&self, sql: &str) -> Result<Vec<ProbedColumn>> {
        Ok(self.resolve(sql)?.columns.clone())
    }

    fn safe_id(&self, id: &str) -> String {
        format!("\"{}\"", id.replace('"', "\"\""))
    }

    fn is_large_object(&self, table: &TableIdentity, column: &ProbedColumn) -> Option<bool> {
        let declared = self.tables.get(table)?;
        declared
            .large_objects
            .contains(&column.name)
            .then_some(true)
    }

    fn open_cursor(&self, sql: &str) -> Result<Box<dyn RowCursor + '_>> {
        let table = self.resolve(sql)?;
        Ok(Box::new(MemoryCursor::new(&table.rows)))
    }
}

/// A single row of decoded source values. Driver cursors decode into it
/// and share its coercions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryRow {
    values: Vec<SourceValue>,
}

impl MemoryRow {
    pub fn new(values: Vec<SourceValue>) -> Self {
        Self { values }
    }

    fn value(&self, idx: usize) -> Result<&SourceValue> {
        self.values
            .get(idx)
            .ok_or_else(|| ImportError::Value(format!("column index {} is out of range", idx)))
    }
}

fn mismatch(value: &SourceValue, wanted: &str) -> ImportError {
    ImportError::Value(format!("cannot read {:?} as {}", value, wanted))
}

fn parse<T: FromStr>(text: &str, value: &SourceValue, wanted: &str) -> Result<T> {
    text.trim().parse().map_err(|_| mismatch(value, wanted))
}

impl SourceRow for MemoryRow {
    fn get_bool(&self, idx: usize) -> Result<Option<bool>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Bool(b) => *b,
            SourceValue::Int(n) => *n != 0,
            SourceValue::Text(s) => {
                let s = s.trim();
                s == "1" || s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("t")
            }
            other => return Err(mismatch(other, "bool")),
        }))
    }

    fn get_i32(&self, idx: usize) -> Result<Option<i32>> {
        match self.get_i64(idx)? {
            None => Ok(None),
            Some(n) => i32::try_from(n)
                .map(Some)
                .map_err(|_| mismatch(&SourceValue::Int(n), "i32")),
        }
    }

    fn get_i64(&self, idx: usize) -> Result<Option<i64>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Bool(b) => i64::from(*b),
            SourceValue::Int(n) => *n,
            SourceValue::Float(f) => *f as i64,
            SourceValue::Double(f) => *f as i64,
            SourceValue::Decimal(d) => d.with_scale(0).to_i64().ok_or_else(|| mismatch(v, "i64"))?,
            SourceValue::Text(s) => parse(s, v, "i64")?,
            other => return Err(mismatch(other, "i64")),
        }))
    }

    fn get_f32(&self, idx: usize) -> Result<Option<f32>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Float(f) => *f,
            SourceValue::Text(s) => parse(s, v, "f32")?,
            _ => return Ok(self.get_f64(idx)?.map(|f| f as f32)),
        }))
    }

    fn get_f64(&self, idx: usize) -> Result<Option<f64>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Int(n) => *n as f64,
            SourceValue::Float(f) => *f as f64,
            SourceValue::Double(f) => *f,
            SourceValue::Decimal(d) => d.to_f64().ok_or_else(|| mismatch(v, "f64"))?,
            SourceValue::Text(s) => parse(s, v, "f64")?,
            other => return Err(mismatch(other, "f64")),
        }))
    }

    fn get_decimal(&self, idx: usize) -> Result<Option<BigDecimal>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Int(n) => BigDecimal::from(*n),
            SourceValue::Float(f) => BigDecimal::from_f32(*f).ok_or_else(|| mismatch(v, "decimal"))?,
            SourceValue::Double(f) => BigDecimal::from_f64(*f).ok_or_else(|| mismatch(v, "decimal"))?,
            SourceValue::Decimal(d) => d.clone(),
            SourceValue::Text(s) => parse(s, v, "decimal")?,
            other => return Err(mismatch(other, "decimal")),
        }))
    }

    fn get_string(&self, idx: usize) -> Result<Option<String>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Bool(b) => b.to_string(),
            SourceValue::Int(n) => n.to_string(),
            SourceValue::Float(f) => f.to_string(),
            SourceValue::Double(f) => f.to_string(),
            SourceValue::Decimal(d) => d.to_string(),
            SourceValue::Text(s) => s.clone(),
            SourceValue::Bytes(b) => hex::encode(b),
            SourceValue::Date(d) => d.format(DATE_FORMAT).to_string(),
            SourceValue::Time(t) => t.format(TIME_FORMAT).to_string(),
            SourceValue::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
            SourceValue::Uuid(u) => u.to_string(),
        }))
    }

    fn get_bytes(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Bytes(b) => b.clone(),
            SourceValue::Text(s) => s.as_bytes().to_vec(),
            SourceValue::Uuid(u) => u.as_bytes().to_vec(),
            other => return Err(mismatch(other, "bytes")),
        }))
    }

    fn get_date(&self, idx: usize) -> Result<Option<NaiveDate>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Date(d) => *d,
            SourceValue::Timestamp(ts) => ts.date(),
            SourceValue::Text(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .map_err(|_| mismatch(v, "date"))?,
            other => return Err(mismatch(other, "date")),
        }))
    }

    fn get_time(&self, idx: usize) -> Result<Option<NaiveTime>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Time(t) => *t,
            SourceValue::Timestamp(ts) => ts.time(),
            SourceValue::Text(s) => NaiveTime::parse_from_str(s.trim(), TIME_FORMAT)
                .map_err(|_| mismatch(v, "time"))?,
            other => return Err(mismatch(other, "time")),
        }))
    }

    fn get_timestamp(&self, idx: usize) -> Result<Option<NaiveDateTime>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Timestamp(ts) => *ts,
            SourceValue::Date(d) => d.and_time(NaiveTime::default()),
            SourceValue::Text(s) => NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
                .map_err(|_| mismatch(v, "timestamp"))?,
            other => return Err(mismatch(other, "timestamp")),
        }))
    }

    fn get_uuid(&self, idx: usize) -> Result<Option<Uuid>> {
        let v = self.value(idx)?;
        Ok(Some(match v {
            SourceValue::Null => return Ok(None),
            SourceValue::Uuid(u) => *u,
            SourceValue::Text(s) => Uuid::parse_str(s.trim()).map_err(|_| mismatch(v, "uuid"))?,
            SourceValue::Bytes(b) => Uuid::from_slice(b).map_err(|_| mismatch(v, "uuid"))?,
            other => return Err(mismatch(other, "uuid")),
        }))
    }

    fn open_blob(&self, idx: usize) -> Result<Option<Box<dyn Read + '_>>> {
        let v = self.value(idx)?;
        match v {
            SourceValue::Null => Ok(None),
            SourceValue::Bytes(b) => Ok(Some(Box::new(Cursor::new(b.as_slice())))),
            SourceValue::Text(s) => Ok(Some(Box::new(Cursor::new(s.as_bytes())))),
            other => Err(mismatch(other, "large object")),
        }
    }
}

/// Cursor over declared rows.
pub struct MemoryCursor<'a> {
    rows: std::slice::Iter<'a, Vec<SourceValue>>,
    current: Option<MemoryRow>,
}

impl<'a> MemoryCursor<'a> {
    pub fn new(rows: &'a [Vec<SourceValue>]) -> Self {
        Self {
            rows: rows.iter(),
            current: None,
        }
    }

    fn row(&self) -> Result<&MemoryRow> {
        self.current
            .as_ref()
            .ok_or_else(|| ImportError::Value("cursor is not on a row".into()))
    }
}

impl SourceRow for MemoryCursor<'_> {
    fn get_bool(&self, idx: usize) -> Result<Option<bool>> {
        self.row()?.get_bool(idx)
    }

    fn get_i32(&self, idx: usize) -> Result<Option<i32>> {
        self.row()?.get_i32(idx)
    }

    fn get_i64(&self, idx: usize) -> Result<Option<i64>> {
        self.row()?.get_i64(idx)
    }

    fn get_f32(&self, idx: usize) -> Result<Option<f32>> {
        self.row()?.get_f32(idx)
    }

    fn get_f64(&self, idx: usize) -> Result<Option<f64>> {
        self.row()?.get_f64(idx)
    }

    fn get_decimal(&self, idx: usize) -> Result<Option<BigDecimal>> {
        self.row()?.get_decimal(idx)
    }

    fn get_string(&self, idx: usize) -> Result<Option<String>> {
        self.row()?.get_string(idx)
    }

    fn get_bytes(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        self.row()?.get_bytes(idx)
    }

    fn get_date(&self, idx: usize) -> Result<Option<NaiveDate>> {
        self.row()?.get_date(idx)
    }

    fn get_time(&self, idx: usize) -> Result<Option<NaiveTime>> {
        self.row()?.get_time(idx)
    }

    fn get_timestamp(&self, idx: usize) -> Result<Option<NaiveDateTime>> {
        self.row()?.get_timestamp(idx)
    }

    fn get_uuid(&self, idx: usize) -> Result<Option<Uuid>> {
        self.row()?.get_uuid(idx)
    }

    fn open_blob(&self, idx: usize) -> Result<Option<Box<dyn Read + '_>>> {
        self.row()?.open_blob(idx)
    }
}

impl RowCursor for MemoryCursor<'_> {
    fn advance(&mut self) -> Result<bool> {
        self.current = self.rows.next().map(|values| MemoryRow::new(values.clone()));
        Ok(self.current.is_some())
    }
}
