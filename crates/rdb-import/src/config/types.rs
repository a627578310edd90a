//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// Name of the option set used when a configuration declares none.
pub const DEFAULT_OPTIONS: &str = "default";

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration.
    pub source: SourceConfig,

    /// Target store configuration. Without it the run is a dry run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetConfig>,

    /// Worker pool configuration.
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Named per-table option sets.
    #[serde(default = "default_table_options")]
    pub table_options: Vec<TableOptions>,

    /// Filters selecting discovered tables, first match wins.
    #[serde(default)]
    pub table_maps: Vec<TableMap>,

    /// Explicitly pinned tables.
    #[serde(default)]
    pub table_refs: Vec<TableRef>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.workers = self.workers.with_auto_tuning(&resources);
        self
    }

    /// Find an option set by name.
    pub fn options(&self, name: &str) -> Option<&TableOptions> {
        self.table_options.iter().find(|o| o.name == name)
    }

    /// Whether the configuration describes a dry run.
    pub fn is_dry_run(&self) -> bool {
        self.target.is_none()
    }
}

/// Source database configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (only "postgres" for now).
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// TLS mode: "disable", "require" or "verify-full" (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Target store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database root prepended to every generated table name.
    #[serde(default)]
    pub database: String,

    /// Optional path of the generated DDL script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_file: Option<PathBuf>,

    /// Drop and recreate tables that already exist (default: false).
    #[serde(default)]
    pub replace_existing: bool,

    /// Copy data after creating tables (default: true).
    #[serde(default = "default_true")]
    pub load_data: bool,

    /// Rows per bulk write of a main table (default: 100).
    #[serde(default = "default_max_batch_rows")]
    pub max_batch_rows: usize,

    /// Chunk rows per bulk write of a BLOB table (default: 100, clamped to 1..=1000).
    #[serde(default = "default_max_blob_rows")]
    pub max_blob_rows: usize,
}

impl TargetConfig {
    /// BLOB chunk batch size clamped to the supported range.
    pub fn get_max_blob_rows(&self) -> usize {
        self.max_blob_rows.clamp(1, 1000)
    }

    /// Full target path for a generated table name.
    pub fn full_path(&self, name: &str) -> String {
        let root = self.database.trim_end_matches('/');
        if root.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", root, name.trim_start_matches('/'))
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            database: String::new(),
            script_file: None,
            replace_existing: false,
            load_data: true,
            max_batch_rows: default_max_batch_rows(),
            max_blob_rows: default_max_blob_rows(),
        }
    }
}

/// Worker pool configuration.
/// `pool_size` is an Option to distinguish "not set" (auto-tune) from
/// "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    /// Number of parallel workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
}

impl WorkerConfig {
    /// Apply auto-tuned defaults based on system resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Workers: cores - 2, but at least 2 and at most 32
        if self.pool_size.is_none() {
            let workers = resources.cpu_cores.saturating_sub(2).clamp(2, 32);
            self.pool_size = Some(workers);
        }
        info!("Auto-tuned config: workers={}", self.get_pool_size());
        self
    }

    pub fn get_pool_size(&self) -> usize {
        self.pool_size.unwrap_or(4)
    }
}

/// Letter case applied to names substituted into templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseMode {
    #[default]
    Asis,
    Upper,
    Lower,
}

impl CaseMode {
    pub fn apply(&self, value: &str) -> String {
        match self {
            CaseMode::Asis => value.to_string(),
            CaseMode::Upper => value.to_uppercase(),
            CaseMode::Lower => value.to_lowercase(),
        }
    }
}

/// Target representation of date and timestamp columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateConv {
    /// Wide-range native types (Date32, Datetime64, Timestamp64).
    #[default]
    DateNew,
    /// Classic native types (Date, Datetime, Timestamp).
    Date,
    /// Integers: YYYYMMDD for dates, epoch milliseconds for timestamps.
    Int,
    /// Strings.
    Str,
}

/// Physical storage layout of main tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Row,
    Column,
}

/// Per-table naming and typing options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Option set name referenced by maps and refs.
    pub name: String,

    #[serde(default)]
    pub case_mode: CaseMode,

    /// Main table name template (default: "${schema}/${table}").
    #[serde(default = "default_table_template")]
    pub table_name_format: String,

    /// BLOB table name template (default: "${schema}/${table}_${field}").
    #[serde(default = "default_blob_template")]
    pub blob_name_format: String,

    #[serde(default)]
    pub date_conv: DateConv,

    #[serde(default)]
    pub timestamp_conv: DateConv,

    /// Allow decimals other than the default (22,9) (default: true).
    #[serde(default = "default_true")]
    pub allow_custom_decimal: bool,

    /// Skip columns of unknown type instead of failing the table.
    #[serde(default)]
    pub skip_unknown_types: bool,

    #[serde(default)]
    pub store_type: StoreType,

    #[serde(default = "default_min_partitions")]
    pub min_partitions: u32,

    #[serde(default = "default_max_partitions")]
    pub max_partitions: u32,
}

impl TableOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            case_mode: CaseMode::default(),
            table_name_format: default_table_template(),
            blob_name_format: default_blob_template(),
            date_conv: DateConv::default(),
            timestamp_conv: DateConv::default(),
            allow_custom_decimal: true,
            skip_unknown_types: false,
            store_type: StoreType::default(),
            min_partitions: default_min_partitions(),
            max_partitions: default_max_partitions(),
        }
    }
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::named(DEFAULT_OPTIONS)
    }
}

/// A schema or table name filter: an exact name, or a rule with an exact
/// name or a regular expression matched against the whole name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameFilter {
    Exact(String),
    Rule {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex: Option<String>,
        #[serde(default)]
        ignore_case: bool,
    },
}

/// Selects discovered tables and assigns them an option set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMap {
    /// Option set applied to matched tables.
    #[serde(default = "default_options_name")]
    pub options: String,

    #[serde(default)]
    pub include_schemas: Vec<NameFilter>,

    #[serde(default)]
    pub exclude_schemas: Vec<NameFilter>,

    #[serde(default)]
    pub include_tables: Vec<NameFilter>,

    #[serde(default)]
    pub exclude_tables: Vec<NameFilter>,
}

/// A table pinned in configuration rather than discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default = "default_options_name")]
    pub options: String,

    pub schema: String,

    pub table: String,

    /// Custom read query replacing the generated SELECT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Key columns replacing key discovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_columns: Vec<String>,
}

impl TableRef {
    pub fn has_query(&self) -> bool {
        self.query.as_deref().is_some_and(|q| !q.trim().is_empty())
    }
}

// Default value functions for serde
fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_batch_rows() -> usize {
    100
}

fn default_max_blob_rows() -> usize {
    100
}

fn default_table_template() -> String {
    "${schema}/${table}".to_string()
}

fn default_blob_template() -> String {
    "${schema}/${table}_${field}".to_string()
}

fn default_min_partitions() -> u32 {
    1
}

fn default_max_partitions() -> u32 {
    9999
}

fn default_options_name() -> String {
    DEFAULT_OPTIONS.to_string()
}

fn default_table_options() -> Vec<TableOptions> {
    vec![TableOptions::default()]
}
