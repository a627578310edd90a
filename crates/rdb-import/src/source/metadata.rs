//! Table metadata retrieval.

use tracing::{debug, warn};

use crate::config::TableRef;
use crate::core::schema::{ColumnInfo, TableIdentity, TableMetadata};
use crate::error::{ImportError, Result};
use crate::source::SourceCatalog;

/// Opening of the zero-row probe wrapper.
pub const ZERO_ROWS_PREFIX: &str = "SELECT q.* FROM (";
/// Closing of the zero-row probe wrapper.
pub const ZERO_ROWS_SUFFIX: &str = ") AS q WHERE 0=1";

/// Wrap a query so that executing it returns no rows but still describes
/// its result columns.
pub fn zero_rows_query(sql: &str) -> String {
    format!("{}{}{}", ZERO_ROWS_PREFIX, sql.trim(), ZERO_ROWS_SUFFIX)
}

/// Canonical read query of a table over the given columns.
pub fn build_select(catalog: &dyn SourceCatalog, table: &TableIdentity, columns: &[String]) -> String {
    let list: Vec<String> = columns.iter().map(|c| catalog.safe_id(c)).collect();
    format!(
        "SELECT {} FROM {}.{}",
        list.join(", "),
        catalog.safe_id(&table.schema),
        catalog.safe_id(&table.table)
    )
}

/// Collect columns, types and key of one table.
///
/// A pinned table may carry a custom query, which replaces the catalog
/// column list, and declared key columns, which replace key discovery.
/// Every failure is reported as [`ImportError::Metadata`].
pub fn read_metadata(
    catalog: &dyn SourceCatalog,
    table: &TableIdentity,
    table_ref: Option<&TableRef>,
) -> Result<TableMetadata> {
    read(catalog, table, table_ref).map_err(|e| match e {
        ImportError::Metadata { .. } => e,
        other => ImportError::metadata(table.full_name(), other.to_string()),
    })
}

fn read(
    catalog: &dyn SourceCatalog,
    table: &TableIdentity,
    table_ref: Option<&TableRef>,
) -> Result<TableMetadata> {
    let name = table.full_name();
    let custom_query = table_ref
        .and_then(|r| r.query.as_deref())
        .map(str::trim)
        .filter(|q| !q.is_empty());
    let mut md = TableMetadata::new();

    match custom_query {
        Some(query) => md.query = query.to_string(),
        None => {
            let names = catalog.grab_column_names(table)?;
            if names.is_empty() {
                return Err(ImportError::metadata(&name, "table has no columns"));
            }
            for column in &names {
                md.add_column(ColumnInfo::new(column.as_str()))?;
            }
            md.query = build_select(catalog, table, &names);
            md.row_count = catalog.grab_row_count(table).unwrap_or_else(|e| {
                warn!("{}: row count unavailable: {}", name, e);
                -1
            });
        }
    }

    let probed = catalog.describe_result(&zero_rows_query(&md.query))?;
    let mut seen = Vec::with_capacity(probed.len());
    for col in probed {
        let blob_override = catalog.is_large_object(table, &col);
        if md.column(&col.name).is_none() {
            md.add_column(ColumnInfo::new(col.name.as_str()))?;
        }
        if let Some(column) = md.column_mut(&col.name) {
            column.sql_type = col.sql_type;
            column.precision = col.precision;
            column.scale = col.scale;
            column.nullable = col.nullable;
            column.blob_override = blob_override;
        }
        seen.push(col.name);
    }
    if let Some(missing) = md.columns().iter().find(|c| !seen.iter().any(|s| s == c.name())) {
        return Err(ImportError::metadata(
            &name,
            format!("column {} is missing from the query result", missing.name()),
        ));
    }

    let declared_key = table_ref
        .map(|r| r.key_columns.as_slice())
        .filter(|k| !k.is_empty());
    match declared_key {
        Some(keys) => {
            for key in keys {
                md.add_key(key)?;
            }
        }
        None if custom_query.is_none() => {
            for key in catalog.grab_primary_key(table)? {
                md.add_key(&key)?;
            }
        }
        None => {}
    }

    debug!(
        "{}: {} columns, key [{}], ~{} rows",
        name,
        md.columns().len(),
        md.key_names().join(", "),
        md.row_count
    );
    Ok(md)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::SqlType;
    use crate::core::value::SourceValue;
    use crate::source::{MemorySource, MemoryTable, ProbedColumn};

    fn orders() -> MemoryTable {
        MemoryTable::new("sales", "orders")
            .column(ProbedColumn::new("id", SqlType::BigInt))
            .column(ProbedColumn::new("amount", SqlType::Numeric).with_precision(10, 2))
            .column(ProbedColumn::new("note", SqlType::Clob))
            .primary_key(&["id"])
            .row(vec![SourceValue::Int(1), SourceValue::Null, SourceValue::Null])
    }

    fn table_ref(query: Option<&str>, keys: &[&str]) -> TableRef {
        TableRef {
            options: "default".into(),
            schema: "sales".into(),
            table: "orders".into(),
            query: query.map(String::from),
            key_columns: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_zero_rows_query() {
        assert_eq!(
            zero_rows_query(" SELECT a FROM t "),
            "SELECT q.* FROM (SELECT a FROM t) AS q WHERE 0=1"
        );
    }

    #[test]
    fn test_catalog_table() {
        let src = MemorySource::new().with_table(orders());
        let id = TableIdentity::new("sales", "orders");
        let md = read_metadata(&src, &id, None).unwrap();
        assert_eq!(md.query, "SELECT \"id\", \"amount\", \"note\" FROM \"sales\".\"orders\"");
        assert_eq!(md.row_count, 1);
        assert_eq!(md.key_names(), ["id".to_string()]);
        let id_col = md.column("id").unwrap();
        assert_eq!(id_col.sql_type, SqlType::BigInt);
        assert!(!id_col.nullable);
        let amount = md.column("amount").unwrap();
        assert_eq!((amount.precision, amount.scale), (10, 2));
        assert_eq!(md.column("note").unwrap().position, 3);
    }

    #[test]
    fn test_declared_key_overrides_catalog() {
        let src = MemorySource::new().with_table(orders());
        let id = TableIdentity::new("sales", "orders");
        let r = table_ref(None, &["amount", "id"]);
        let md = read_metadata(&src, &id, Some(&r)).unwrap();
        assert_eq!(md.key_names(), ["amount".to_string(), "id".to_string()]);
        assert!(!md.column("amount").unwrap().nullable);
    }

    #[test]
    fn test_declared_key_must_exist() {
        let src = MemorySource::new().with_table(orders());
        let id = TableIdentity::new("sales", "orders");
        let r = table_ref(None, &["nope"]);
        let err = read_metadata(&src, &id, Some(&r)).unwrap_err();
        assert!(matches!(err, ImportError::Metadata { .. }));
    }

    #[test]
    fn test_custom_query_describes_columns_without_key() {
        let sql = "SELECT id, amount * 2 AS doubled FROM sales.orders";
        let result = MemoryTable::new("sales", "orders")
            .column(ProbedColumn::new("id", SqlType::BigInt))
            .column(ProbedColumn::new("doubled", SqlType::Numeric).with_precision(11, 2));
        let src = MemorySource::new().with_table(orders()).with_query(sql, result);
        let id = TableIdentity::new("sales", "orders");
        let md = read_metadata(&src, &id, Some(&table_ref(Some(sql), &[]))).unwrap();
        assert_eq!(md.query, sql);
        let names: Vec<&str> = md.columns().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["id", "doubled"]);
        assert!(!md.has_key());
        assert_eq!(md.row_count, -1);
    }

    #[test]
    fn test_large_object_override() {
        let src = MemorySource::new().with_table(orders().large_object("id"));
        let md = read_metadata(&src, &TableIdentity::new("sales", "orders"), None).unwrap();
        assert!(md.column("id").unwrap().is_blob());
        assert!(!md.column("amount").unwrap().is_blob());
    }

    #[test]
    fn test_catalog_failure_is_metadata_error() {
        let id = TableIdentity::new("sales", "orders");
        let src = MemorySource::new()
            .with_table(orders())
            .with_failing_table(id.clone());
        let err = read_metadata(&src, &id, None).unwrap_err();
        match err {
            ImportError::Metadata { table, .. } => assert_eq!(table, "sales.orders"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
