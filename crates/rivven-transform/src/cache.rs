//! # Schema Reduction Cache
//!
//! Per-table derived state: the latest announced source schema, the reduced
//! schema derived from it by the matching rules, and the projection plan
//! between the two.
//!
//! Entries are immutable and shared as `Arc`s. A new announcement builds a
//! fresh entry and swaps it in, so concurrent readers (e.g. a checkpoint)
//! see either the old or the new entry of a table, never a mix.

use crate::error::{Result, TransformError};
use crate::event::DataChangeEvent;
use crate::projector::ProjectionPlan;
use crate::rule::TransformRule;
use crate::schema::{Column, Schema};
use crate::table_id::TableId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Cached pre-transform state of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct PreTransformChangeInfo {
    table_id: TableId,
    source_schema: Schema,
    reduced_schema: Schema,
    plan: ProjectionPlan,
    has_asterisk: bool,
}

impl PreTransformChangeInfo {
    /// Derive the reduced schema of `table_id` from `rules`.
    ///
    /// 1. Matching rules with metadata overrides are applied in declaration
    ///    order; each non-empty field replaces the previous value.
    /// 2. Referenced columns of every matching rule are unioned. A wildcard
    ///    rule, or no matching rule at all, keeps every column.
    /// 3. Primary key columns of the resolved metadata always survive.
    /// 4. The reduced schema keeps source column order.
    pub fn build(table_id: TableId, source_schema: Schema, rules: &[TransformRule]) -> Result<Self> {
        let matching: Vec<&TransformRule> =
            rules.iter().filter(|rule| rule.matches(&table_id)).collect();

        let mut resolved = source_schema.clone();
        for rule in matching.iter().filter(|rule| !rule.metadata().is_empty()) {
            resolved = rule.metadata().apply(&resolved)?;
        }

        let has_asterisk = matching.is_empty() || matching.iter().any(|rule| rule.has_wildcard());
        let reduced_schema = if has_asterisk {
            resolved
        } else {
            let mut referenced: HashSet<String> = HashSet::new();
            for rule in &matching {
                let columns = rule
                    .expression()
                    .referenced_columns(&source_schema, rule.metadata_columns())?;
                referenced.extend(columns.into_iter().map(|c| c.name));
            }
            referenced.extend(resolved.primary_keys().iter().cloned());

            let columns: Vec<Column> = source_schema
                .columns()
                .iter()
                .filter(|c| referenced.contains(&c.name))
                .cloned()
                .collect();
            resolved.copy_with_columns(columns)
        };

        let plan = ProjectionPlan::new(&reduced_schema, &source_schema)?;
        Ok(Self {
            table_id,
            source_schema,
            reduced_schema,
            plan,
            has_asterisk,
        })
    }

    /// Rebuild from previously derived schemas.
    pub fn from_schemas(
        table_id: TableId,
        source_schema: Schema,
        reduced_schema: Schema,
        has_asterisk: bool,
    ) -> Result<Self> {
        let plan = ProjectionPlan::new(&reduced_schema, &source_schema)?;
        Ok(Self {
            table_id,
            source_schema,
            reduced_schema,
            plan,
            has_asterisk,
        })
    }

    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    pub fn source_schema(&self) -> &Schema {
        &self.source_schema
    }

    pub fn reduced_schema(&self) -> &Schema {
        &self.reduced_schema
    }

    pub fn plan(&self) -> &ProjectionPlan {
        &self.plan
    }

    /// Whether every source column is kept.
    pub fn has_asterisk(&self) -> bool {
        self.has_asterisk
    }

    /// Re-encode a data change against the reduced schema.
    pub fn project(&self, event: &DataChangeEvent) -> Result<DataChangeEvent> {
        self.plan.apply_to_event(event)
    }
}

/// Serializable cache contents for a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub tables: Vec<CachedTable>,
}

/// One table of a [`CacheSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTable {
    pub table_id: TableId,
    pub source_schema: Schema,
    pub reduced_schema: Schema,
    #[serde(default)]
    pub has_asterisk: bool,
}

impl From<&PreTransformChangeInfo> for CachedTable {
    fn from(info: &PreTransformChangeInfo) -> Self {
        Self {
            table_id: info.table_id.clone(),
            source_schema: info.source_schema.clone(),
            reduced_schema: info.reduced_schema.clone(),
            has_asterisk: info.has_asterisk,
        }
    }
}

/// Concurrent map from table to its cached state.
#[derive(Debug, Default)]
pub struct SchemaReductionCache {
    entries: DashMap<TableId, Arc<PreTransformChangeInfo>>,
}

impl SchemaReductionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the entry for a schema announcement and replace any previous one.
    ///
    /// Returns the new entry and the one it replaced.
    pub fn build_or_replace(
        &self,
        table_id: &TableId,
        source_schema: &Schema,
        rules: &[TransformRule],
    ) -> Result<(Arc<PreTransformChangeInfo>, Option<Arc<PreTransformChangeInfo>>)> {
        let info = Arc::new(PreTransformChangeInfo::build(
            table_id.clone(),
            source_schema.clone(),
            rules,
        )?);
        let previous = self.insert(Arc::clone(&info));
        Ok((info, previous))
    }

    /// Store an entry, returning the one it replaced.
    pub fn insert(&self, info: Arc<PreTransformChangeInfo>) -> Option<Arc<PreTransformChangeInfo>> {
        self.entries.insert(info.table_id.clone(), info)
    }

    pub fn get(&self, table_id: &TableId) -> Option<Arc<PreTransformChangeInfo>> {
        self.entries.get(table_id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, table_id: &TableId) -> bool {
        self.entries.contains_key(table_id)
    }

    pub fn remove(&self, table_id: &TableId) -> Option<Arc<PreTransformChangeInfo>> {
        self.entries.remove(table_id).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Cached tables, sorted.
    pub fn table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<TableId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Copy the cache contents, sorted by table.
    ///
    /// Each table is read atomically; the snapshot as a whole is not.
    pub fn snapshot(&self) -> CacheSnapshot {
        let mut tables: Vec<CachedTable> = self
            .entries
            .iter()
            .map(|e| CachedTable::from(e.value().as_ref()))
            .collect();
        tables.sort_by(|a, b| a.table_id.cmp(&b.table_id));
        CacheSnapshot { tables }
    }

    /// Replace the cache contents with a snapshot.
    ///
    /// Nothing is changed if any table of the snapshot is inconsistent.
    pub fn restore(&self, snapshot: &CacheSnapshot) -> Result<()> {
        let infos = snapshot
            .tables
            .iter()
            .map(|t| {
                PreTransformChangeInfo::from_schemas(
                    t.table_id.clone(),
                    t.source_schema.clone(),
                    t.reduced_schema.clone(),
                    t.has_asterisk,
                )
                .map_err(|e| {
                    TransformError::schema(format!(
                        "Cannot restore cached state of table {}: {}",
                        t.table_id, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.entries.clear();
        for info in infos {
            self.insert(Arc::new(info));
        }
        Ok(())
    }
}
