//! Core data model shared by every pipeline stage.
//!
//! - [`schema`]: source tables, columns and table metadata
//! - [`value`]: source values, target types and target values
//! - [`decision`]: per-table pipeline state

pub mod decision;
pub mod schema;
pub mod value;

pub use decision::TableDecision;
pub use schema::{ColumnInfo, SqlType, TableIdentity, TableMetadata};
pub use value::{Field, Row, SourceValue, TargetType, TargetValue};
