//! Row projection
//!
//! Re-encodes row images from a source schema into a reduced schema. Values
//! are located by column name, so the result only depends on the two schemas
//! and the input image.
//!
//! A [`ProjectionPlan`] resolves the name lookups once per schema pair; the
//! cache keeps one per table so data events only pay for index copies.

use crate::error::{Result, TransformError};
use crate::event::{DataChangeEvent, RowImage};
use crate::schema::Schema;

/// Source positions of every reduced schema column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionPlan {
    indices: Vec<usize>,
    source_width: usize,
    identity: bool,
}

impl ProjectionPlan {
    /// Resolve `reduced` columns against `source`.
    ///
    /// Fails when `reduced` has a column `source` does not.
    pub fn new(reduced: &Schema, source: &Schema) -> Result<Self> {
        let indices = reduced
            .columns()
            .iter()
            .map(|column| {
                source.column_index(&column.name).ok_or_else(|| {
                    TransformError::schema(format!(
                        "Column '{}' of the reduced schema is not part of the source schema",
                        column.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let source_width = source.column_count();
        let identity =
            indices.len() == source_width && indices.iter().enumerate().all(|(i, j)| i == *j);

        Ok(Self {
            indices,
            source_width,
            identity,
        })
    }

    /// True when projection leaves images unchanged.
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn source_width(&self) -> usize {
        self.source_width
    }

    pub fn target_width(&self) -> usize {
        self.indices.len()
    }

    /// Project one image encoded against the source schema.
    pub fn apply(&self, image: &RowImage) -> Result<RowImage> {
        if image.len() != self.source_width {
            return Err(TransformError::RowLayout {
                expected: self.source_width,
                actual: image.len(),
            });
        }
        if self.identity {
            return Ok(image.clone());
        }
        let values = image.values();
        Ok(RowImage::new(
            self.indices.iter().map(|&i| values[i].clone()).collect(),
        ))
    }

    /// Project both halves of a change; absent halves stay absent.
    pub fn apply_to_event(&self, event: &DataChangeEvent) -> Result<DataChangeEvent> {
        Ok(DataChangeEvent {
            table_id: event.table_id.clone(),
            op: event.op,
            before: event.before.as_ref().map(|b| self.apply(b)).transpose()?,
            after: event.after.as_ref().map(|a| self.apply(a)).transpose()?,
            meta: event.meta.clone(),
        })
    }
}

/// Project `image` (encoded against `source`) into `reduced` column order.
///
/// `project(r, r, image)` returns `image` unchanged.
pub fn project(reduced: &Schema, source: &Schema, image: &RowImage) -> Result<RowImage> {
    ProjectionPlan::new(reduced, source)?.apply(image)
}
