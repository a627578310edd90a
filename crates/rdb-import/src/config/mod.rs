//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl SourceConfig {
    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} sslmode={}",
            self.host, self.port, self.database, self.user, self.ssl_mode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
source:
  host: localhost
  database: shop
  user: reader
  password: secret
table_maps:
  - include_schemas: [public]
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.source.port, 5432);
        assert_eq!(config.source.ssl_mode, "require");
        assert!(config.is_dry_run());
        assert_eq!(config.table_options.len(), 1);
        assert_eq!(config.table_options[0].name, DEFAULT_OPTIONS);
        assert_eq!(config.workers.get_pool_size(), 4);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
source:
  host: db
  database: shop
  user: reader
workers:
  pool_size: 8
target:
  database: /local/import
  script_file: out.sql
  replace_existing: true
  max_batch_rows: 500
  max_blob_rows: 5000
table_options:
  - name: default
    case_mode: lower
    date_conv: int
    timestamp_conv: str
    store_type: column
table_maps:
  - options: default
    include_schemas: [public, { regex: "sales_.*" }]
    exclude_tables: [{ name: AUDIT, ignore_case: true }]
table_refs:
  - schema: public
    table: orders
    query: SELECT * FROM public.orders WHERE id > 0
    key_columns: [id]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let target = config.target.as_ref().unwrap();
        assert_eq!(target.max_batch_rows, 500);
        assert_eq!(target.get_max_blob_rows(), 1000);
        assert!(target.load_data);
        assert_eq!(target.full_path("public/orders"), "/local/import/public/orders");
        let opts = config.options("default").unwrap();
        assert_eq!(opts.case_mode, CaseMode::Lower);
        assert_eq!(opts.date_conv, DateConv::Int);
        assert_eq!(opts.timestamp_conv, DateConv::Str);
        assert_eq!(opts.store_type, StoreType::Column);
        assert_eq!(config.table_maps[0].include_schemas.len(), 2);
        assert!(config.table_refs[0].has_query());
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Config::from_yaml(MINIMAL).unwrap();
        let b = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn test_connection_string_omits_password() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let conn = config.source.connection_string();
        assert!(conn.contains("dbname=shop"));
        assert!(!conn.contains("secret"));
    }
}
