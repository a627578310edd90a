//! Target table definitions produced by the schema builder.

use serde::Serialize;

use crate::core::schema::TableIdentity;
use crate::core::value::{Field, TargetType};
use crate::error::{ImportError, Result};
use crate::target::TableDescription;

/// Reserved name of the hash-derived key field of keyless tables. Source
/// columns of a keyless table may not use it.
pub const SYNTH_KEY_FIELD: &str = "ydb_synth_key";

/// Field layout shared by every BLOB chunk table.
pub fn blob_fields() -> Vec<Field> {
    vec![
        Field::new("id", TargetType::Int64, false),
        Field::new("pos", TargetType::Int32, false),
        Field::new("val", TargetType::Bytes, false),
    ]
}

/// One table to create and fill on the target side.
#[derive(Debug, Clone, Serialize)]
pub struct TargetTable {
    /// Source table this definition was derived from.
    pub owner: TableIdentity,
    /// Full target path.
    pub path: String,
    /// Creation script.
    pub ddl: String,
    fields: Vec<Field>,
    synth_key_pos: Option<usize>,
}

impl TargetTable {
    /// A table keyed by source columns.
    pub fn new(owner: TableIdentity, path: String, ddl: String, fields: Vec<Field>) -> Self {
        Self {
            owner,
            path,
            ddl,
            fields,
            synth_key_pos: None,
        }
    }

    /// Mark the field at `pos` as the synthetic key of a keyless table.
    #[must_use]
    pub fn with_synth_key(mut self, pos: usize) -> Self {
        self.synth_key_pos = Some(pos);
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Position of the synthetic key field, `None` for tables with a natural key.
    pub fn synth_key_pos(&self) -> Option<usize> {
        self.synth_key_pos
    }

    /// Replace the field list with the layout of an existing physical table.
    /// All fields become optional. A keyless definition requires the
    /// existing table to carry the synthetic key field.
    pub fn reconcile(&mut self, existing: &TableDescription) -> Result<()> {
        let keyless = self.synth_key_pos.is_some();
        let fields: Vec<Field> = existing
            .fields
            .iter()
            .map(|f| Field::new(f.name.clone(), f.ty, true))
            .collect();
        let synth_key_pos = if keyless {
            fields.iter().position(|f| f.name == SYNTH_KEY_FIELD)
        } else {
            None
        };
        if keyless && synth_key_pos.is_none() {
            return Err(ImportError::schema(
                self.owner.full_name(),
                format!(
                    "existing table {} lacks the {} field",
                    self.path, SYNTH_KEY_FIELD
                ),
            ));
        }
        self.fields = fields;
        self.synth_key_pos = synth_key_pos;
        Ok(())
    }
}
