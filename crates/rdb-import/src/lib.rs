//! # rdb-import
//!
//! Parallel import of relational database tables into a tabular store.
//!
//! The library discovers source tables, reads their metadata, derives a
//! target layout for each, creates the target tables and copies the rows:
//!
//! - **Table selection** through schema/table filters and pinned tables
//! - **Type derivation** with per-table options for dates, decimals and unknown types
//! - **Synthetic keys** hashed from row content for tables without a key
//! - **BLOB externalization** into chunk tables of 64 KiB blocks
//! - **Parallel stages** on a bounded worker pool with per-table failure isolation
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rdb_import::{Config, Importer, PostgresSource};
//!
//! #[tokio::main]
//! async fn main() -> rdb_import::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let source = PostgresSource::connect(&config.source, config.workers.get_pool_size()).await?;
//!     let result = Importer::new(config, Arc::new(source)).run().await?;
//!     println!("{}", result.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod convert;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod source;
pub mod target;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, SourceConfig, TableOptions, TargetConfig};
pub use error::{ImportError, Result, TargetError};
pub use orchestrator::{ImportResult, Importer, WorkerPool};
pub use source::{MemorySource, MemoryTable, PostgresSource, SourceCatalog};
pub use target::{MemoryTarget, TargetStore, TargetTable};
pub use transfer::{LoadDataTask, ProgressCounter};
