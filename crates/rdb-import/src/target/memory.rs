//! In-memory target store.
//!
//! Understands the `CREATE TABLE` scripts produced by the schema builder and
//! keeps written rows per path. Used by tests and for local trial runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::core::value::{Field, Row, TargetType};
use crate::error::{StatusCode, TargetError};
use crate::target::{TableDescription, TargetStore};

#[derive(Debug, Default)]
struct StoredTable {
    description: Option<TableDescription>,
    rows: Vec<Row>,
    upload_sizes: Vec<usize>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, StoredTable>,
    scripts: Vec<String>,
    schema_failures: VecDeque<TargetError>,
    upload_failures: BTreeMap<String, TargetError>,
    drops: usize,
}

/// Target store keeping everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    state: Mutex<State>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next schema operations (drop or create) with these errors, in order.
    pub fn fail_next_schema_ops(&self, errors: Vec<TargetError>) {
        self.state().schema_failures.extend(errors);
    }

    /// Fail every upload to `path`.
    pub fn fail_uploads(&self, path: &str, error: TargetError) {
        self.state().upload_failures.insert(path.to_string(), error);
    }

    pub fn table(&self, path: &str) -> Option<TableDescription> {
        self.state()
            .tables
            .get(path)
            .and_then(|t| t.description.clone())
    }

    pub fn table_paths(&self) -> Vec<String> {
        self.state()
            .tables
            .iter()
            .filter(|(_, t)| t.description.is_some())
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Rows written to `path`, in write order.
    pub fn rows(&self, path: &str) -> Vec<Row> {
        self.state()
            .tables
            .get(path)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Size of every bulk write to `path`.
    pub fn upload_sizes(&self, path: &str) -> Vec<usize> {
        self.state()
            .tables
            .get(path)
            .map(|t| t.upload_sizes.clone())
            .unwrap_or_default()
    }

    /// Schema scripts executed successfully.
    pub fn scripts(&self) -> Vec<String> {
        self.state().scripts.clone()
    }

    pub fn drop_count(&self) -> usize {
        self.state().drops
    }
}

impl TargetStore for MemoryTarget {
    fn describe_table(&self, path: &str) -> Result<Option<TableDescription>, TargetError> {
        Ok(self.table(path))
    }

    fn drop_table(&self, path: &str) -> Result<(), TargetError> {
        let mut state = self.state();
        if let Some(err) = state.schema_failures.pop_front() {
            return Err(err);
        }
        match state.tables.get_mut(path) {
            Some(table) if table.description.is_some() => {
                table.description = None;
                table.rows.clear();
                state.drops += 1;
                Ok(())
            }
            _ => Err(TargetError::message(
                StatusCode::NotFound,
                format!("table {} does not exist", path),
            )),
        }
    }

    fn execute_schema(&self, script: &str) -> Result<(), TargetError> {
        let mut state = self.state();
        if let Some(err) = state.schema_failures.pop_front() {
            return Err(err);
        }
        let description = parse_create_table(script)?;
        let entry = state.tables.entry(description.path.clone()).or_default();
        if entry.description.is_some() {
            return Err(TargetError::message(
                StatusCode::SchemeError,
                format!("table {} already exists", description.path),
            ));
        }
        entry.description = Some(description);
        state.scripts.push(script.to_string());
        Ok(())
    }

    fn bulk_upsert(&self, path: &str, fields: &[Field], rows: &[Row]) -> Result<(), TargetError> {
        let mut state = self.state();
        if let Some(err) = state.upload_failures.get(path) {
            return Err(err.clone());
        }
        let table = state
            .tables
            .get_mut(path)
            .filter(|t| t.description.is_some())
            .ok_or_else(|| {
                TargetError::message(StatusCode::NotFound, format!("table {} does not exist", path))
            })?;
        for row in rows {
            if row.len() != fields.len() {
                return Err(TargetError::message(
                    StatusCode::BadRequest,
                    format!("row has {} values for {} fields", row.len(), fields.len()),
                ));
            }
        }
        table.upload_sizes.push(rows.len());
        table.rows.extend(rows.iter().cloned());
        Ok(())
    }
}

fn parse_error(message: impl Into<String>) -> TargetError {
    TargetError::message(StatusCode::BadRequest, message)
}

/// Parse the `CREATE TABLE` dialect emitted by the schema builder.
fn parse_create_table(script: &str) -> Result<TableDescription, TargetError> {
    let mut lines = script.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines.next().ok_or_else(|| parse_error("empty script"))?;
    let path = header
        .strip_prefix("CREATE TABLE `")
        .and_then(|rest| rest.strip_suffix("` ("))
        .ok_or_else(|| parse_error(format!("unexpected statement: {}", header)))?
        .to_string();

    let mut fields = Vec::new();
    let mut primary_key = Vec::new();
    for line in lines {
        if let Some(keys) = line.strip_prefix("PRIMARY KEY (") {
            let keys = keys.trim_end_matches(')');
            primary_key = keys
                .split(',')
                .map(|k| k.trim().trim_matches('`').to_string())
                .collect();
            continue;
        }
        let Some(rest) = line.strip_prefix('`') else {
            continue;
        };
        let (name, ty) = rest
            .split_once("` ")
            .ok_or_else(|| parse_error(format!("bad field line: {}", line)))?;
        let ty = ty.trim_end_matches(',');
        let (ty, optional) = match ty.strip_suffix(" NOT NULL") {
            Some(ty) => (ty, false),
            None => (ty, true),
        };
        let ty = TargetType::parse(ty)
            .ok_or_else(|| parse_error(format!("unknown type {} for field {}", ty, name)))?;
        fields.push(Field::new(name, ty, optional));
    }
    if fields.is_empty() || primary_key.is_empty() {
        return Err(parse_error(format!("table {} needs fields and a primary key", path)));
    }
    Ok(TableDescription {
        path,
        fields,
        primary_key,
    })
}
