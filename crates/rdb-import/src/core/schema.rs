//! Source-side catalog types: table identities, columns and table metadata.
//!
//! These types describe what was found in the source database and are
//! independent of any target representation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};

/// Declared SQL type of a source column, following the JDBC type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Real,
    Double,
    Numeric,
    Decimal,
    Char,
    VarChar,
    LongVarChar,
    Date,
    Time,
    Timestamp,
    Binary,
    VarBinary,
    LongVarBinary,
    Boolean,
    Blob,
    Clob,
    NChar,
    NVarChar,
    LongNVarChar,
    NClob,
    SqlXml,
    TimeWithTimezone,
    TimestampWithTimezone,
    /// Any other code reported by a driver.
    Other(i32),
}

impl SqlType {
    /// Resolve a numeric JDBC type code.
    pub fn from_code(code: i32) -> Self {
        match code {
            -7 => SqlType::Bit,
            -6 => SqlType::TinyInt,
            5 => SqlType::SmallInt,
            4 => SqlType::Integer,
            -5 => SqlType::BigInt,
            6 => SqlType::Float,
            7 => SqlType::Real,
            8 => SqlType::Double,
            2 => SqlType::Numeric,
            3 => SqlType::Decimal,
            1 => SqlType::Char,
            12 => SqlType::VarChar,
            -1 => SqlType::LongVarChar,
            91 => SqlType::Date,
            92 => SqlType::Time,
            93 => SqlType::Timestamp,
            -2 => SqlType::Binary,
            -3 => SqlType::VarBinary,
            -4 => SqlType::LongVarBinary,
            16 => SqlType::Boolean,
            2004 => SqlType::Blob,
            2005 => SqlType::Clob,
            -15 => SqlType::NChar,
            -9 => SqlType::NVarChar,
            -16 => SqlType::LongNVarChar,
            2011 => SqlType::NClob,
            2009 => SqlType::SqlXml,
            2013 => SqlType::TimeWithTimezone,
            2014 => SqlType::TimestampWithTimezone,
            other => SqlType::Other(other),
        }
    }

    /// Numeric JDBC type code.
    pub fn code(&self) -> i32 {
        match self {
            SqlType::Bit => -7,
            SqlType::TinyInt => -6,
            SqlType::SmallInt => 5,
            SqlType::Integer => 4,
            SqlType::BigInt => -5,
            SqlType::Float => 6,
            SqlType::Real => 7,
            SqlType::Double => 8,
            SqlType::Numeric => 2,
            SqlType::Decimal => 3,
            SqlType::Char => 1,
            SqlType::VarChar => 12,
            SqlType::LongVarChar => -1,
            SqlType::Date => 91,
            SqlType::Time => 92,
            SqlType::Timestamp => 93,
            SqlType::Binary => -2,
            SqlType::VarBinary => -3,
            SqlType::LongVarBinary => -4,
            SqlType::Boolean => 16,
            SqlType::Blob => 2004,
            SqlType::Clob => 2005,
            SqlType::NChar => -15,
            SqlType::NVarChar => -9,
            SqlType::LongNVarChar => -16,
            SqlType::NClob => 2011,
            SqlType::SqlXml => 2009,
            SqlType::TimeWithTimezone => 2013,
            SqlType::TimestampWithTimezone => 2014,
            SqlType::Other(code) => *code,
        }
    }

    /// Types stored out of line in an auxiliary chunk table.
    pub fn is_large_object(&self) -> bool {
        matches!(
            self,
            SqlType::Blob | SqlType::LongVarBinary | SqlType::SqlXml
        )
    }

    /// Integer and fixed-point numeric types.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::Bit
                | SqlType::TinyInt
                | SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Numeric
                | SqlType::Decimal
        )
    }

    /// Character string types.
    pub fn is_character(&self) -> bool {
        matches!(
            self,
            SqlType::Char
                | SqlType::VarChar
                | SqlType::LongVarChar
                | SqlType::NChar
                | SqlType::NVarChar
                | SqlType::LongNVarChar
                | SqlType::Clob
                | SqlType::NClob
        )
    }

    /// Short binary types held inline.
    pub fn is_binary(&self) -> bool {
        matches!(self, SqlType::Binary | SqlType::VarBinary)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlType::Other(code) => write!(f, "OTHER({})", code),
            other => write!(f, "{:?}({})", other, other.code()),
        }
    }
}

/// Schema-qualified source table name. Used as a deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdentity {
    pub schema: String,
    pub table: String,
}

impl TableIdentity {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// One source column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    name: String,
    destination_name: String,
    /// 1-based position in the table's column list, 0 until added.
    pub position: usize,
    pub sql_type: SqlType,
    pub precision: i32,
    pub scale: i32,
    pub nullable: bool,
    /// Dialect override of the large-object flag derived from `sql_type`.
    pub blob_override: Option<bool>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            destination_name: safe_column_name(&name),
            name,
            position: 0,
            sql_type: SqlType::VarChar,
            precision: 0,
            scale: 0,
            nullable: true,
            blob_override: None,
        }
    }

    /// Builder-style type setter.
    pub fn with_type(mut self, sql_type: SqlType, precision: i32, scale: i32) -> Self {
        self.sql_type = sql_type;
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name used on the target side.
    pub fn destination_name(&self) -> &str {
        &self.destination_name
    }

    pub fn is_blob(&self) -> bool {
        self.blob_override
            .unwrap_or_else(|| self.sql_type.is_large_object())
    }
}

/// Replace characters the target store does not accept in column names.
pub fn safe_column_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ' ' | '.' | '/' | '`' => '_',
            other => other,
        })
        .collect()
}

/// Full description of one source table, as needed to read it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    columns: Vec<ColumnInfo>,
    /// Key column names, in key order.
    key: Vec<String>,
    /// Approximate row count, -1 when unknown.
    pub row_count: i64,
    /// Canonical read query.
    pub query: String,
}

impl TableMetadata {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            key: Vec::new(),
            row_count: -1,
            query: String::new(),
        }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [ColumnInfo] {
        &mut self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnInfo> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Key columns in key order.
    pub fn key(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.key.iter().filter_map(move |k| self.column(k))
    }

    pub fn key_names(&self) -> &[String] {
        &self.key
    }

    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    /// Append a column, assigning its 1-based position.
    pub fn add_column(&mut self, mut column: ColumnInfo) -> Result<&mut ColumnInfo> {
        if self.column(column.name()).is_some() {
            return Err(ImportError::Catalog(format!(
                "Duplicate column: {}",
                column.name()
            )));
        }
        column.position = self.columns.len() + 1;
        self.columns.push(column);
        let last = self.columns.len() - 1;
        Ok(&mut self.columns[last])
    }

    /// Append a key column by name. The column must already be present.
    pub fn add_key(&mut self, name: &str) -> Result<()> {
        let column = self.column_mut(name).ok_or_else(|| {
            ImportError::Catalog(format!("Key column is not in the column list: {}", name))
        })?;
        column.nullable = false;
        if !self.key.iter().any(|k| k == name) {
            self.key.push(name.to_string());
        }
        Ok(())
    }

    pub fn clear_key(&mut self) {
        self.key.clear();
    }

    pub fn is_valid(&self) -> bool {
        !self.columns.is_empty() && !self.query.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_column_name() {
        assert_eq!(safe_column_name("order id"), "order_id");
        assert_eq!(safe_column_name("a.b/c`d"), "a_b_c_d");
        assert_eq!(safe_column_name("plain"), "plain");
        assert_eq!(safe_column_name(""), "");
    }

    #[test]
    fn test_type_code_round_trip_for_known_codes() {
        for code in [-7, -6, 5, 4, -5, 6, 7, 8, 2, 3, 1, 12, 91, 92, 93, 2004] {
            assert_eq!(SqlType::from_code(code).code(), code);
        }
        assert_eq!(SqlType::from_code(1111), SqlType::Other(1111));
    }

    #[test]
    fn test_blob_flag() {
        let col = ColumnInfo::new("photo").with_type(SqlType::Blob, 0, 0);
        assert!(col.is_blob());
        let mut col = ColumnInfo::new("oid").with_type(SqlType::BigInt, 0, 0);
        assert!(!col.is_blob());
        col.blob_override = Some(true);
        assert!(col.is_blob());
    }

    #[test]
    fn test_add_column_positions_and_duplicates() {
        let mut md = TableMetadata::new();
        md.add_column(ColumnInfo::new("id")).unwrap();
        md.add_column(ColumnInfo::new("name")).unwrap();
        assert_eq!(md.columns()[0].position, 1);
        assert_eq!(md.columns()[1].position, 2);
        assert!(md.add_column(ColumnInfo::new("id")).is_err());
    }

    #[test]
    fn test_add_key_requires_column() {
        let mut md = TableMetadata::new();
        md.add_column(ColumnInfo::new("id")).unwrap();
        assert!(md.add_key("missing").is_err());
        md.add_key("id").unwrap();
        assert!(md.has_key());
        assert!(!md.column("id").unwrap().nullable);
    }

    #[test]
    fn test_validity() {
        let mut md = TableMetadata::new();
        assert_eq!(md.row_count, -1);
        assert!(!md.is_valid());
        md.add_column(ColumnInfo::new("id")).unwrap();
        assert!(!md.is_valid());
        md.query = "SELECT id FROM t".into();
        assert!(md.is_valid());
    }
}
