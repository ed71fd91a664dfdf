//! # Pre-Transform Engine
//!
//! Consumes the ordered event stream of a CDC source and rewrites it so that
//! every table only carries the columns its transform rules need.
//!
//! - A [`CreateTableEvent`] rebuilds the table's cache entry and is re-emitted
//!   with the reduced schema. Downstream never sees the full schema.
//! - A [`DataChangeEvent`] is re-encoded against the cached reduced schema.
//!   Its table must have been announced first.
//! - A [`ControlEvent`] passes through untouched.
//!
//! ```rust
//! use rivven_transform::{PreTransformEngine, TransformConfig, TransformRuleConfig};
//! use rivven_transform::event::{CreateTableEvent, DataChangeEvent, Event, RowImage};
//! use rivven_transform::schema::{Column, DataType, Schema};
//! use rivven_transform::table_id::TableId;
//! use serde_json::json;
//!
//! let config = TransformConfig::builder()
//!     .transform(TransformRuleConfig::new("db.orders").with_projection("id, amount"))
//!     .build()
//!     .unwrap();
//! let engine = PreTransformEngine::new(config).unwrap();
//!
//! let table = TableId::with_schema("db", "orders");
//! let schema = Schema::builder()
//!     .column(Column::new("id", DataType::BigInt))
//!     .column(Column::new("amount", DataType::Double))
//!     .column(Column::new("customer", DataType::String))
//!     .primary_key(["id"])
//!     .build()
//!     .unwrap();
//!
//! engine.process(CreateTableEvent::new(table.clone(), schema).into()).unwrap();
//! let out = engine
//!     .process(DataChangeEvent::insert(table, RowImage::new(vec![json!(1), json!(9.5), json!("x")])).into())
//!     .unwrap();
//!
//! match out {
//!     Event::DataChange(e) => assert_eq!(e.after.unwrap().values(), &[json!(1), json!(9.5)]),
//!     _ => unreachable!(),
//! }
//! ```

use crate::cache::{CacheSnapshot, SchemaReductionCache};
use crate::error::{Result, TransformError};
use crate::event::{ControlEvent, CreateTableEvent, DataChangeEvent, Event};
use crate::expression::{ExpressionCompiler, SqlExpressionCompiler};
use crate::rule::{TransformConfig, TransformRule};
use crate::schema::Schema;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Stage name attached to processing failures.
pub const STAGE_NAME: &str = "pre-transform";

/// Statistics for engine execution.
#[derive(Debug, Default)]
pub struct TransformStats {
    /// Schema announcements processed
    pub schema_events: AtomicU64,
    /// Data changes projected
    pub data_events: AtomicU64,
    /// Control events passed through
    pub control_events: AtomicU64,
    /// Announcements that replaced an existing cache entry
    pub schema_replacements: AtomicU64,
    /// Data changes whose images were narrowed
    pub rows_narrowed: AtomicU64,
    /// Processing failures
    pub errors: AtomicU64,
}

impl TransformStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_schema(&self, replaced: bool) {
        self.schema_events.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.schema_replacements.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_data(&self, narrowed: bool) {
        self.data_events.fetch_add(1, Ordering::Relaxed);
        if narrowed {
            self.rows_narrowed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_control(&self) {
        self.control_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransformStatsSnapshot {
        TransformStatsSnapshot {
            schema_events: self.schema_events.load(Ordering::Relaxed),
            data_events: self.data_events.load(Ordering::Relaxed),
            control_events: self.control_events.load(Ordering::Relaxed),
            schema_replacements: self.schema_replacements.load(Ordering::Relaxed),
            rows_narrowed: self.rows_narrowed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransformStatsSnapshot {
    pub schema_events: u64,
    pub data_events: u64,
    pub control_events: u64,
    pub schema_replacements: u64,
    pub rows_narrowed: u64,
    pub errors: u64,
}

impl TransformStatsSnapshot {
    /// Total events that left the engine.
    pub fn events_processed(&self) -> u64 {
        self.schema_events + self.data_events + self.control_events
    }
}

/// Schema-aware projection stage of a CDC pipeline.
///
/// One engine serves one partition of the table set. Processing takes
/// `&self`; the cache is also reachable through [`cache`](Self::cache) for
/// checkpointing while events flow.
#[derive(Debug)]
pub struct PreTransformEngine {
    config: TransformConfig,
    rules: Vec<TransformRule>,
    cache: Arc<SchemaReductionCache>,
    stats: Arc<TransformStats>,
    /// Held for reading while an event is processed; `true` once shut down
    closed: RwLock<bool>,
}

impl PreTransformEngine {
    /// Create an engine using the built-in expression compiler.
    pub fn new(config: TransformConfig) -> Result<Self> {
        Self::with_compiler(config, Arc::new(SqlExpressionCompiler::new()))
    }

    /// Create an engine with a custom expression compiler.
    ///
    /// Every rule is validated and compiled here; no event is accepted from
    /// an invalid configuration.
    pub fn with_compiler(
        config: TransformConfig,
        compiler: Arc<dyn ExpressionCompiler>,
    ) -> Result<Self> {
        let rules = config.compile_rules(compiler.as_ref())?;
        info!(
            rules = rules.len(),
            udfs = config.udfs.len(),
            "Pre-transform engine ready"
        );
        Ok(Self {
            config,
            rules,
            cache: Arc::new(SchemaReductionCache::new()),
            stats: Arc::new(TransformStats::new()),
            closed: RwLock::new(false),
        })
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    pub fn rules(&self) -> &[TransformRule] {
        &self.rules
    }

    /// Shared handle to the cache for the checkpoint path.
    pub fn cache(&self) -> Arc<SchemaReductionCache> {
        Arc::clone(&self.cache)
    }

    pub fn stats(&self) -> TransformStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Process one event.
    ///
    /// Failures are wrapped in [`TransformError::Execution`] with the event
    /// and the schemas cached for its table.
    pub fn process(&self, event: Event) -> Result<Event> {
        let closed = self.closed.read();
        if *closed {
            return Err(TransformError::Closed);
        }

        let kind = event.kind();
        let result = match event {
            Event::CreateTable(e) => match self.on_create_table(&e) {
                Ok(reduced) => Ok(Event::CreateTable(CreateTableEvent::new(e.table_id, reduced))),
                Err(cause) => Err(self.fail(Event::CreateTable(e), cause)),
            },
            Event::DataChange(e) => match self.on_data_change(&e) {
                Ok(projected) => Ok(Event::DataChange(projected)),
                Err(cause) => Err(self.fail(Event::DataChange(e), cause)),
            },
            Event::Control(e) => Ok(self.on_control(e)),
        };

        if result.is_ok() {
            metrics::counter!("rivven_transform_events_total", "kind" => kind).increment(1);
        }
        result
    }

    /// Process events in order, stopping at the first failure.
    pub fn process_batch(&self, events: impl IntoIterator<Item = Event>) -> Result<Vec<Event>> {
        events.into_iter().map(|event| self.process(event)).collect()
    }

    /// Drive the engine from a channel until the input closes.
    ///
    /// Returns the number of events forwarded. Stops early without error if
    /// the output side is dropped; stops with the error on the first failure.
    pub async fn run(&self, mut input: mpsc::Receiver<Event>, output: mpsc::Sender<Event>) -> Result<u64> {
        let mut forwarded = 0u64;
        while let Some(event) = input.recv().await {
            let event = self.process(event)?;
            if output.send(event).await.is_err() {
                warn!(forwarded, "Downstream closed, stopping pre-transform task");
                break;
            }
            forwarded += 1;
        }
        debug!(forwarded, "Pre-transform input exhausted");
        Ok(forwarded)
    }

    /// Copy the cache for a checkpoint.
    pub fn checkpoint(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    /// Restore the cache from a checkpoint.
    pub fn restore(&self, snapshot: &CacheSnapshot) -> Result<()> {
        let closed = self.closed.read();
        if *closed {
            return Err(TransformError::Closed);
        }
        self.cache.restore(snapshot)?;
        info!(tables = snapshot.tables.len(), "Restored pre-transform cache");
        Ok(())
    }

    /// Stop accepting events and release the cache. Idempotent.
    pub fn shutdown(&self) {
        let mut closed = self.closed.write();
        if *closed {
            return;
        }
        *closed = true;
        let tables = self.cache.len();
        self.cache.clear();
        info!(tables, "Pre-transform engine shut down");
    }

    fn on_create_table(&self, event: &CreateTableEvent) -> Result<Schema> {
        let (info, previous) =
            self.cache
                .build_or_replace(&event.table_id, &event.schema, &self.rules)?;

        self.stats.record_schema(previous.is_some());
        metrics::counter!("rivven_transform_schema_rebuilds_total").increment(1);
        info!(
            table = %event.table_id,
            source_columns = info.source_schema().column_count(),
            reduced_columns = info.reduced_schema().column_count(),
            asterisk = info.has_asterisk(),
            replaced = previous.is_some(),
            "Cached pre-transform schema"
        );
        Ok(info.reduced_schema().clone())
    }

    fn on_data_change(&self, event: &DataChangeEvent) -> Result<DataChangeEvent> {
        let info = self
            .cache
            .get(&event.table_id)
            .ok_or_else(|| TransformError::missing_schema(event.table_id.clone()))?;

        let projected = info.project(event)?;
        let narrowed = !info.plan().is_identity();
        self.stats.record_data(narrowed);
        debug!(
            table = %event.table_id,
            op = %event.op,
            narrowed,
            "Projected data change"
        );
        Ok(projected)
    }

    fn on_control(&self, event: ControlEvent) -> Event {
        self.stats.record_control();
        Event::Control(event)
    }

    fn fail(&self, event: Event, cause: TransformError) -> TransformError {
        self.stats.record_error();
        metrics::counter!(
            "rivven_transform_errors_total",
            "code" => cause.error_code()
        )
        .increment(1);

        let table_id = event.table_id().cloned();
        // both schemas come from the same cached version; an announced schema
        // that failed to build travels inside the event
        let cached = table_id.as_ref().and_then(|id| self.cache.get(id));
        let (source_schema, reduced_schema) = match cached {
            Some(info) => (
                Some(info.source_schema().clone()),
                Some(info.reduced_schema().clone()),
            ),
            None => (None, None),
        };

        error!(
            stage = STAGE_NAME,
            table = ?table_id.as_ref().map(|t| t.to_string()),
            code = cause.error_code(),
            "Pre-transform failed: {}",
            cause
        );
        TransformError::execution(
            STAGE_NAME,
            event,
            table_id,
            source_schema,
            reduced_schema,
            cause,
        )
    }
}

impl Drop for PreTransformEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{OperationType, RowImage};
    use crate::rule::TransformRuleConfig;
    use crate::schema::{Column, DataType};
    use crate::table_id::TableId;
    use serde_json::json;

    fn engine(rules: Vec<TransformRuleConfig>) -> PreTransformEngine {
        PreTransformEngine::new(TransformConfig {
            transforms: rules,
            ..Default::default()
        })
        .unwrap()
    }

    fn orders_id() -> TableId {
        TableId::with_schema("db", "orders")
    }

    fn orders() -> Schema {
        Schema::builder()
            .column(Column::new("id", DataType::BigInt))
            .column(Column::new("amount", DataType::Double))
            .column(Column::new("customer", DataType::String))
            .column(Column::new("ts", DataType::Timestamp(3)))
            .primary_key(["id"])
            .build()
            .unwrap()
    }

    fn order_row(id: i64, amount: f64) -> RowImage {
        RowImage::new(vec![json!(id), json!(amount), json!("x"), json!("2024-01-01")])
    }

    fn announce(engine: &PreTransformEngine) -> Schema {
        match engine
            .process(CreateTableEvent::new(orders_id(), orders()).into())
            .unwrap()
        {
            Event::CreateTable(e) => e.schema,
            other => panic!("unexpected event {:?}", other),
        }
    }

    fn large_orders() -> Vec<TransformRuleConfig> {
        vec![TransformRuleConfig::new("db.orders")
            .with_projection("id, amount")
            .with_filter("amount > 100")]
    }

    #[test]
    fn test_create_table_emits_reduced_schema() {
        let engine = engine(large_orders());
        let reduced = announce(&engine);
        assert_eq!(reduced.column_names(), vec!["id", "amount"]);
        assert_eq!(engine.stats().schema_events, 1);
    }

    #[test]
    fn test_data_change_projected() {
        let engine = engine(large_orders());
        announce(&engine);

        let event = DataChangeEvent::update(
            orders_id(),
            Some(order_row(5, 90.0)),
            order_row(5, 150.0),
        )
        .with_meta("op_ts", "1700000000");
        let out = engine.process(event.into()).unwrap();

        let Event::DataChange(out) = out else {
            panic!("expected data change");
        };
        assert_eq!(out.op, OperationType::Update);
        assert_eq!(out.table_id, orders_id());
        assert_eq!(out.before.unwrap().values(), &[json!(5), json!(90.0)]);
        assert_eq!(out.after.unwrap().values(), &[json!(5), json!(150.0)]);
        assert_eq!(out.meta["op_ts"], "1700000000");

        let stats = engine.stats();
        assert_eq!(stats.data_events, 1);
        assert_eq!(stats.rows_narrowed, 1);
    }

    #[test]
    fn test_missing_schema_is_fatal() {
        let engine = engine(large_orders());
        let event = Event::from(DataChangeEvent::insert(orders_id(), order_row(1, 1.0)));
        let err = engine.process(event.clone()).unwrap_err();

        assert!(err.is_missing_schema());
        let failure = err.failure().unwrap();
        assert_eq!(failure.stage, STAGE_NAME);
        assert_eq!(failure.event, event);
        assert_eq!(failure.table_id, Some(orders_id()));
        assert!(failure.source_schema.is_none());
        assert_eq!(engine.stats().errors, 1);
    }

    #[test]
    fn test_missing_schema_without_rules() {
        let engine = engine(vec![]);
        let err = engine
            .process(DataChangeEvent::insert(orders_id(), order_row(1, 1.0)).into())
            .unwrap_err();
        assert!(err.is_missing_schema());
    }

    #[test]
    fn test_failure_carries_cached_schemas() {
        let engine = engine(large_orders());
        let reduced = announce(&engine);

        let err = engine
            .process(
                DataChangeEvent::insert(orders_id(), RowImage::new(vec![json!(1)])).into(),
            )
            .unwrap_err();
        assert!(matches!(err.root_cause(), TransformError::RowLayout { .. }));
        let failure = err.failure().unwrap();
        assert_eq!(failure.source_schema.as_ref(), Some(&orders()));
        assert_eq!(failure.reduced_schema.as_ref(), Some(&reduced));
        assert!(err.to_string().contains("pre-transform"));
        assert!(err.to_string().contains("db.orders"));
    }

    #[test]
    fn test_compilation_failure_on_announcement() {
        let engine = engine(vec![
            TransformRuleConfig::new("db.orders").with_projection("id, price")
        ]);
        let err = engine
            .process(CreateTableEvent::new(orders_id(), orders()).into())
            .unwrap_err();
        assert_eq!(err.error_code(), "rule_compilation_error");
        let failure = err.failure().unwrap();
        assert!(failure.source_schema.is_none());
        assert!(failure.reduced_schema.is_none());
        let Event::CreateTable(attempted) = &failure.event else {
            panic!("expected create table event");
        };
        assert_eq!(attempted.schema, orders());
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn test_failed_reannouncement_reports_cached_version() {
        let engine = engine(large_orders());
        let reduced = announce(&engine);

        let narrowed = Schema::builder()
            .column(Column::new("id", DataType::BigInt))
            .column(Column::new("note", DataType::String))
            .primary_key(["id"])
            .build()
            .unwrap();
        let err = engine
            .process(CreateTableEvent::new(orders_id(), narrowed.clone()).into())
            .unwrap_err();
        assert_eq!(err.error_code(), "rule_compilation_error");

        let failure = err.failure().unwrap();
        let source = failure.source_schema.as_ref().unwrap();
        assert_eq!(source, &orders());
        assert_eq!(failure.reduced_schema.as_ref(), Some(&reduced));
        for column in reduced.columns() {
            assert!(source.column(&column.name).is_some());
        }
        let Event::CreateTable(attempted) = &failure.event else {
            panic!("expected create table event");
        };
        assert_eq!(attempted.schema, narrowed);

        // the previous version stays cached
        let cached = engine.cache().get(&orders_id()).unwrap();
        assert_eq!(cached.source_schema(), &orders());
    }

    #[test]
    fn test_control_events_pass_through() {
        let engine = engine(large_orders());
        let event = Event::from(ControlEvent::new("flush", json!({"n": 1})).for_table(orders_id()));
        assert_eq!(engine.process(event.clone()).unwrap(), event);
        assert_eq!(engine.stats().control_events, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = PreTransformEngine::new(TransformConfig {
            transforms: vec![TransformRuleConfig::new("db.orders").with_filter("amount >")],
            ..Default::default()
        });
        // the tokenizer accepts a dangling operator; unbalanced input is rejected
        assert!(result.is_ok());

        let result = PreTransformEngine::new(TransformConfig {
            transforms: vec![TransformRuleConfig::new("db.orders").with_filter("(amount > 1")],
            ..Default::default()
        });
        assert!(matches!(result, Err(TransformError::Compilation(_))));
    }

    #[test]
    fn test_process_batch_stops_at_first_error() {
        let engine = engine(large_orders());
        let result = engine.process_batch(vec![
            DataChangeEvent::insert(orders_id(), order_row(1, 1.0)).into(),
            CreateTableEvent::new(orders_id(), orders()).into(),
        ]);
        assert!(result.is_err());
        assert!(engine.cache().is_empty());

        let out = engine
            .process_batch(vec![
                CreateTableEvent::new(orders_id(), orders()).into(),
                DataChangeEvent::insert(orders_id(), order_row(1, 1.0)).into(),
            ])
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_schema_replacement() {
        let engine = engine(vec![TransformRuleConfig::new("db.orders").with_projection("*")]);
        announce(&engine);

        let v2 = Schema::builder()
            .column(Column::new("id", DataType::BigInt))
            .column(Column::new("region", DataType::String))
            .primary_key(["id"])
            .build()
            .unwrap();
        engine
            .process(CreateTableEvent::new(orders_id(), v2.clone()).into())
            .unwrap();
        assert_eq!(engine.stats().schema_replacements, 1);

        // images of the old layout no longer fit
        assert!(engine
            .process(DataChangeEvent::insert(orders_id(), order_row(1, 1.0)).into())
            .is_err());

        let out = engine
            .process(
                DataChangeEvent::insert(orders_id(), RowImage::new(vec![json!(1), json!("eu")]))
                    .into(),
            )
            .unwrap();
        let Event::DataChange(out) = out else {
            panic!("expected data change");
        };
        assert_eq!(out.after.unwrap().values(), &[json!(1), json!("eu")]);
        assert_eq!(engine.stats().rows_narrowed, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let engine = engine(large_orders());
        announce(&engine);
        assert_eq!(engine.cache().len(), 1);

        engine.shutdown();
        engine.shutdown();
        assert!(engine.is_closed());
        assert!(engine.cache().is_empty());
        assert!(matches!(
            engine.process(ControlEvent::new("flush", json!(null)).into()),
            Err(TransformError::Closed)
        ));
    }

    #[test]
    fn test_restore_after_shutdown_rejected() {
        let engine = engine(large_orders());
        announce(&engine);
        let snapshot = engine.checkpoint();

        engine.shutdown();
        assert!(matches!(engine.restore(&snapshot), Err(TransformError::Closed)));
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn test_checkpoint_restore() {
        let engine = engine(large_orders());
        announce(&engine);
        let snapshot = engine.checkpoint();

        let restored = self::engine(large_orders());
        restored.restore(&snapshot).unwrap();
        let out = restored
            .process(DataChangeEvent::insert(orders_id(), order_row(7, 200.0)).into())
            .unwrap();
        let Event::DataChange(out) = out else {
            panic!("expected data change");
        };
        assert_eq!(out.after.unwrap().values(), &[json!(7), json!(200.0)]);
    }

    #[tokio::test]
    async fn test_run_over_channels() {
        let engine = Arc::new(engine(large_orders()));
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        let task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(in_rx, out_tx).await })
        };

        in_tx
            .send(CreateTableEvent::new(orders_id(), orders()).into())
            .await
            .unwrap();
        in_tx
            .send(DataChangeEvent::insert(orders_id(), order_row(1, 500.0)).into())
            .await
            .unwrap();
        drop(in_tx);

        let forwarded = task.await.unwrap().unwrap();
        assert_eq!(forwarded, 2);

        assert!(matches!(out_rx.recv().await, Some(Event::CreateTable(_))));
        match out_rx.recv().await {
            Some(Event::DataChange(e)) => {
                assert_eq!(e.after.unwrap().values(), &[json!(1), json!(500.0)])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_error() {
        let engine = engine(large_orders());
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);

        in_tx
            .send(DataChangeEvent::insert(orders_id(), order_row(1, 1.0)).into())
            .await
            .unwrap();
        drop(in_tx);

        let err = engine.run(in_rx, out_tx).await.unwrap_err();
        assert!(err.is_missing_schema());
    }
}
