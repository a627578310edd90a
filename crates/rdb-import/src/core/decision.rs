//! Per-table pipeline state.

use std::sync::Arc;

use crate::config::{TableOptions, TableRef};
use crate::core::schema::{TableIdentity, TableMetadata};
use crate::target::TargetTable;

/// One table's state as it moves through the pipeline.
///
/// Created at discovery, filled in by each stage, never removed. A failed
/// decision keeps whatever it had and is skipped by later stages.
#[derive(Debug, Clone)]
pub struct TableDecision {
    pub identity: TableIdentity,
    pub options: Arc<TableOptions>,
    /// Set when the table was pinned in configuration.
    pub table_ref: Option<TableRef>,
    pub metadata: Option<TableMetadata>,
    pub target: Option<TargetTable>,
    /// BLOB chunk tables by source column name, in column order.
    pub blob_targets: Vec<(String, TargetTable)>,
    pub failed: bool,
}

impl TableDecision {
    pub fn new(
        identity: TableIdentity,
        options: Arc<TableOptions>,
        table_ref: Option<TableRef>,
    ) -> Self {
        Self {
            identity,
            options,
            table_ref,
            metadata: None,
            target: None,
            blob_targets: Vec::new(),
            failed: false,
        }
    }

    /// Chunk table of a BLOB column.
    pub fn blob_target(&self, column: &str) -> Option<&TargetTable> {
        self.blob_targets
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, table)| table)
    }

    pub fn blob_target_mut(&mut self, column: &str) -> Option<&mut TargetTable> {
        self.blob_targets
            .iter_mut()
            .find(|(name, _)| name == column)
            .map(|(_, table)| table)
    }

    pub fn is_valid(&self) -> bool {
        !self.identity.table.is_empty()
            && self.metadata.as_ref().is_some_and(|m| m.is_valid())
            && self.target.is_some()
    }
}
