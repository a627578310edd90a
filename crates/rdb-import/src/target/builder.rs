//! Target schema derivation.
//!
//! Turns a table's source metadata into a [`TargetTable`] (field list plus
//! creation script) and one auxiliary chunk table per BLOB column. Output
//! depends only on the inputs, so re-running over the same source yields the
//! same scripts.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use tracing::warn;

use crate::config::{DateConv, StoreType, TableOptions, TargetConfig};
use crate::core::decision::TableDecision;
use crate::core::schema::{ColumnInfo, SqlType};
use crate::core::value::{Field, TargetType, MAX_DECIMAL_PRECISION};
use crate::error::{ImportError, Result};
use crate::target::table::{blob_fields, TargetTable, SYNTH_KEY_FIELD};

/// Main table plus its BLOB chunk tables, keyed by source column name.
#[derive(Debug, Clone)]
pub struct BuiltSchema {
    pub main: TargetTable,
    pub blobs: Vec<(String, TargetTable)>,
}

/// Derive the target type of one column.
///
/// `Ok(None)` means the type is unknown and the options ask to skip it.
pub fn convert_type(column: &ColumnInfo, options: &TableOptions) -> Result<Option<TargetType>> {
    // Surrogate id of the chunk sequence in the BLOB table.
    if column.is_blob() {
        return Ok(Some(TargetType::Int64));
    }
    let ty = match column.sql_type {
        SqlType::Boolean | SqlType::Bit => TargetType::Bool,
        SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer => TargetType::Int32,
        SqlType::BigInt => TargetType::Int64,
        SqlType::Numeric | SqlType::Decimal => convert_numeric(column, options),
        SqlType::Double => TargetType::Double,
        SqlType::Float | SqlType::Real => TargetType::Float,
        SqlType::Char
        | SqlType::VarChar
        | SqlType::LongVarChar
        | SqlType::NChar
        | SqlType::NVarChar
        | SqlType::LongNVarChar
        | SqlType::Clob
        | SqlType::NClob => TargetType::Text,
        SqlType::Binary | SqlType::VarBinary => TargetType::Bytes,
        // Large object types the dialect asked to read inline.
        SqlType::Blob | SqlType::LongVarBinary => TargetType::Bytes,
        SqlType::SqlXml => TargetType::Text,
        SqlType::Date => match options.date_conv {
            DateConv::DateNew => TargetType::Date32,
            DateConv::Date => TargetType::Date,
            DateConv::Int => TargetType::Int32,
            DateConv::Str => TargetType::Text,
        },
        // Seconds since midnight.
        SqlType::Time => TargetType::Int32,
        SqlType::Timestamp | SqlType::TimestampWithTimezone => {
            let whole_seconds = column.scale == 0;
            match options.timestamp_conv {
                DateConv::DateNew if whole_seconds => TargetType::Datetime64,
                DateConv::DateNew => TargetType::Timestamp64,
                DateConv::Date if whole_seconds => TargetType::Datetime,
                DateConv::Date => TargetType::Timestamp,
                DateConv::Int => TargetType::Uint64,
                DateConv::Str => TargetType::Text,
            }
        }
        SqlType::TimeWithTimezone | SqlType::Other(_) => {
            if options.skip_unknown_types {
                return Ok(None);
            }
            return Err(ImportError::UnsupportedType {
                column: column.name().to_string(),
                code: column.sql_type.code(),
            });
        }
    };
    Ok(Some(ty))
}

fn convert_numeric(column: &ColumnInfo, options: &TableOptions) -> TargetType {
    let (precision, scale) = (column.precision, column.scale);
    if scale < 0 {
        return TargetType::Double;
    }
    if scale == 0 {
        return match precision {
            p if p <= 0 => TargetType::Double,
            p if p < 10 => TargetType::Int32,
            p if p < 20 => TargetType::Int64,
            _ if options.allow_custom_decimal => TargetType::Decimal {
                precision: MAX_DECIMAL_PRECISION,
                scale: 0,
            },
            _ => TargetType::Int64,
        };
    }
    if !options.allow_custom_decimal || precision <= 0 {
        return TargetType::default_decimal();
    }
    let precision = precision.min(MAX_DECIMAL_PRECISION as i32);
    let scale = scale.min(precision);
    TargetType::Decimal {
        precision: precision as u8,
        scale: scale as u8,
    }
}

/// Substitute `${schema}`, `${table}` and `${field}` into a name template.
pub fn format_name(
    template: &str,
    options: &TableOptions,
    schema: &str,
    table: &str,
    field: Option<&str>,
) -> String {
    let mode = options.case_mode;
    let mut name = template
        .replace("${schema}", &mode.apply(schema))
        .replace("${table}", &mode.apply(table));
    if let Some(field) = field {
        name = name.replace("${field}", &mode.apply(field));
    }
    name
}

/// Build the target schema of one table.
///
/// Returns `Ok(None)` when no column has a usable type; the caller skips the
/// table. Metadata must already be present on the decision.
pub fn build_schema(decision: &TableDecision, target: &TargetConfig) -> Result<Option<BuiltSchema>> {
    let identity = &decision.identity;
    let options = decision.options.as_ref();
    let metadata = decision.metadata.as_ref().ok_or_else(|| {
        ImportError::schema(identity.full_name(), "metadata has not been retrieved")
    })?;

    let name = format_name(
        &options.table_name_format,
        options,
        &identity.schema,
        &identity.table,
        None,
    );
    let path = target.full_path(&name);

    let mut fields = Vec::with_capacity(metadata.columns().len() + 1);
    for column in metadata.columns() {
        let ty = convert_type(column, options).map_err(|e| {
            ImportError::schema(
                identity.full_name(),
                format!("cannot convert type for column [{}] of [{}]: {}", column.name(), path, e),
            )
        })?;
        match ty {
            Some(ty) => fields.push(Field::new(column.destination_name(), ty, column.nullable)),
            None => warn!(
                "{}: skipped column {} due to unknown type {}",
                identity,
                column.name(),
                column.sql_type
            ),
        }
    }
    if fields.is_empty() {
        warn!("{}: no columns have a usable type, skipping table", identity);
        return Ok(None);
    }

    let (key, synth_key_pos) = if metadata.has_key() {
        let key: Vec<String> = metadata
            .key()
            .map(|c| c.destination_name().to_string())
            .collect();
        (key, None)
    } else {
        fields.push(Field::new(SYNTH_KEY_FIELD, TargetType::Text, false));
        (vec![SYNTH_KEY_FIELD.to_string()], Some(fields.len() - 1))
    };

    let duplicate = {
        let mut seen = BTreeSet::new();
        let first = fields.iter().find(|f| !seen.insert(f.name.as_str()));
        first.map(|f| f.name.clone())
    };
    if let Some(name) = duplicate {
        let reason = if name == SYNTH_KEY_FIELD {
            "is reserved for the synthetic key"
        } else {
            "is produced by more than one source column"
        };
        return Err(ImportError::schema(
            identity.full_name(),
            format!("target field name [{}] of [{}] {}", name, path, reason),
        ));
    }

    let ddl = create_table_script(&path, &fields, &key, Some(options));
    let mut main = TargetTable::new(identity.clone(), path, ddl, fields);
    if let Some(pos) = synth_key_pos {
        main = main.with_synth_key(pos);
    }

    let mut blobs = Vec::new();
    for column in metadata.columns().iter().filter(|c| c.is_blob()) {
        let name = format_name(
            &options.blob_name_format,
            options,
            &identity.schema,
            &identity.table,
            Some(column.destination_name()),
        );
        let path = target.full_path(&name);
        let fields = blob_fields();
        let key = vec!["id".to_string(), "pos".to_string()];
        let ddl = create_table_script(&path, &fields, &key, None);
        blobs.push((
            column.name().to_string(),
            TargetTable::new(identity.clone(), path, ddl, fields),
        ));
    }

    Ok(Some(BuiltSchema { main, blobs }))
}

/// Render a `CREATE TABLE` script. Storage settings are emitted only when
/// options are given.
fn create_table_script(
    path: &str,
    fields: &[Field],
    key: &[String],
    options: Option<&TableOptions>,
) -> String {
    let mut sql = String::new();
    let _ = writeln!(sql, "CREATE TABLE `{}` (", path);
    for field in fields {
        let _ = write!(sql, "  `{}` {}", field.name, field.ty);
        if !field.optional {
            sql.push_str(" NOT NULL");
        }
        sql.push_str(",\n");
    }
    let key_list: Vec<String> = key.iter().map(|k| format!("`{}`", k)).collect();
    let _ = writeln!(sql, "  PRIMARY KEY ({})", key_list.join(", "));
    match options {
        None => sql.push_str(");\n"),
        Some(opts) if opts.store_type == StoreType::Column => {
            sql.push_str(") WITH (\n  STORE = COLUMN\n);\n");
        }
        Some(opts) => {
            sql.push_str(") WITH (\n");
            sql.push_str("  AUTO_PARTITIONING_BY_SIZE = ENABLED,\n");
            sql.push_str("  AUTO_PARTITIONING_BY_LOAD = ENABLED,\n");
            let _ = writeln!(
                sql,
                "  AUTO_PARTITIONING_MIN_PARTITIONS_COUNT = {},",
                opts.min_partitions
            );
            let _ = writeln!(
                sql,
                "  AUTO_PARTITIONING_MAX_PARTITIONS_COUNT = {}",
                opts.max_partitions
            );
            sql.push_str(");\n");
        }
    }
    sql
}

/// Append one table's section to a DDL script.
pub fn append_script(out: &mut String, table: &TargetTable) {
    let _ = writeln!(out, "-- {}", table.path);
    out.push_str(&table.ddl);
    out.push('\n');
}
