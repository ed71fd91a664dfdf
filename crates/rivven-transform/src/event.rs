//! Pipeline event representation
//!
//! The event stream between a CDC source and its sink is a closed set of
//! variants:
//!
//! - [`CreateTableEvent`] announces (or re-announces) a table's schema
//! - [`DataChangeEvent`] carries the before/after row images of one change
//! - [`ControlEvent`] is anything else (flush, watermark, DDL the
//!   pre-transform does not rewrite) and passes through untouched
//!
//! Row images are positional: value `i` belongs to column `i` of the schema
//! the image was encoded against.

use crate::error::{Result, TransformError};
use crate::schema::Schema;
use crate::table_id::TableId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Positional row values encoded against a specific schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowImage(Vec<Value>);

impl RowImage {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Encode a JSON object against `schema`. Keys absent from the object
    /// become `null`; keys not in the schema are ignored.
    pub fn from_object(schema: &Schema, object: &Map<String, Value>) -> Self {
        Self(
            schema
                .columns()
                .iter()
                .map(|c| object.get(&c.name).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Decode into a JSON object keyed by the column names of `schema`.
    pub fn to_object(&self, schema: &Schema) -> Result<Map<String, Value>> {
        self.check_layout(schema)?;
        Ok(schema
            .columns()
            .iter()
            .zip(&self.0)
            .map(|(c, v)| (c.name.clone(), v.clone()))
            .collect())
    }

    /// Value of a column by name.
    pub fn get(&self, schema: &Schema, column: &str) -> Option<&Value> {
        schema.column_index(column).and_then(|i| self.0.get(i))
    }

    /// Ensure this image has exactly one value per schema column.
    pub fn check_layout(&self, schema: &Schema) -> Result<()> {
        if self.0.len() != schema.column_count() {
            return Err(TransformError::RowLayout {
                expected: schema.column_count(),
                actual: self.0.len(),
            });
        }
        Ok(())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for RowImage {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Schema announcement for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTableEvent {
    pub table_id: TableId,
    pub schema: Schema,
}

impl CreateTableEvent {
    pub fn new(table_id: TableId, schema: Schema) -> Self {
        Self { table_id, schema }
    }
}

/// Row-level change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Row inserted (after only)
    Insert,
    /// Row updated (before optional, after)
    Update,
    /// Row deleted (before only)
    Delete,
    /// Row upserted without a before image
    Replace,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Insert => write!(f, "INSERT"),
            OperationType::Update => write!(f, "UPDATE"),
            OperationType::Delete => write!(f, "DELETE"),
            OperationType::Replace => write!(f, "REPLACE"),
        }
    }
}

/// A captured row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeEvent {
    pub table_id: TableId,
    pub op: OperationType,
    /// Previous row state (for UPDATE/DELETE)
    #[serde(default)]
    pub before: Option<RowImage>,
    /// Current row state (for INSERT/UPDATE/REPLACE)
    #[serde(default)]
    pub after: Option<RowImage>,
    /// Source metadata (op_ts, scn, ...), carried through unchanged
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl DataChangeEvent {
    /// Create a new INSERT event
    pub fn insert(table_id: TableId, after: RowImage) -> Self {
        Self {
            table_id,
            op: OperationType::Insert,
            before: None,
            after: Some(after),
            meta: BTreeMap::new(),
        }
    }

    /// Create a new UPDATE event
    pub fn update(table_id: TableId, before: Option<RowImage>, after: RowImage) -> Self {
        Self {
            table_id,
            op: OperationType::Update,
            before,
            after: Some(after),
            meta: BTreeMap::new(),
        }
    }

    /// Create a new DELETE event
    pub fn delete(table_id: TableId, before: RowImage) -> Self {
        Self {
            table_id,
            op: OperationType::Delete,
            before: Some(before),
            after: None,
            meta: BTreeMap::new(),
        }
    }

    /// Create a new REPLACE event
    pub fn replace(table_id: TableId, after: RowImage) -> Self {
        Self {
            table_id,
            op: OperationType::Replace,
            before: None,
            after: Some(after),
            meta: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Any event the pre-transform does not rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    /// Event kind, e.g. "flush", "watermark", "alter_column"
    pub kind: String,
    /// Table the event refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<TableId>,
    /// Opaque payload
    #[serde(default)]
    pub payload: Value,
}

impl ControlEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            table_id: None,
            payload,
        }
    }

    pub fn for_table(mut self, table_id: TableId) -> Self {
        self.table_id = Some(table_id);
        self
    }
}

/// Pipeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    CreateTable(CreateTableEvent),
    DataChange(DataChangeEvent),
    Control(ControlEvent),
}

impl Event {
    /// Table this event belongs to, if any.
    pub fn table_id(&self) -> Option<&TableId> {
        match self {
            Event::CreateTable(e) => Some(&e.table_id),
            Event::DataChange(e) => Some(&e.table_id),
            Event::Control(e) => e.table_id.as_ref(),
        }
    }

    /// Short metric-safe name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::CreateTable(_) => "create_table",
            Event::DataChange(_) => "data_change",
            Event::Control(_) => "control",
        }
    }
}

impl From<CreateTableEvent> for Event {
    fn from(e: CreateTableEvent) -> Self {
        Event::CreateTable(e)
    }
}

impl From<DataChangeEvent> for Event {
    fn from(e: DataChangeEvent) -> Self {
        Event::DataChange(e)
    }
}

impl From<ControlEvent> for Event {
    fn from(e: ControlEvent) -> Self {
        Event::Control(e)
    }
}
