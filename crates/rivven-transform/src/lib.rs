//! # rivven-transform - Schema-Aware Pre-Transform for Rivven CDC
//!
//! Narrows the event stream of a CDC source to the columns that downstream
//! projections and filters actually need, per table, before the full
//! transform stage runs.
//!
//! ## Architecture
//!
//! ```text
//!  CDC source ──► CreateTable / DataChange / Control events
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  PreTransformEngine                      │
//! │                                                          │
//! │  CreateTable ──► Selectors + TransformRules              │
//! │                  + ExpressionCompiler ──► cache entry    │
//! │                           (source schema, reduced schema)│
//! │  DataChange  ──► cache entry ──► ProjectionPlan          │
//! │  Control     ──► pass through                            │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!          reduced CreateTable / projected DataChange events
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rivven_transform::{PreTransformEngine, TransformConfig};
//!
//! let config = TransformConfig::from_yaml_str(
//!     r#"
//! transforms:
//!   - source-table: db.orders
//!     projection: id, amount
//!     filter: amount > 100
//! "#,
//! )
//! .unwrap();
//!
//! let engine = PreTransformEngine::new(config).unwrap();
//! assert_eq!(engine.rules().len(), 1);
//! ```
//!
//! Tables no rule selects pass through unchanged. A data change for a table
//! whose schema the engine has not seen is a fatal error.

pub mod cache;
pub mod engine;
pub mod error;
pub mod event;
pub mod expression;
pub mod pattern;
pub mod projector;
pub mod rule;
pub mod schema;
pub mod selector;
pub mod table_id;

pub use cache::{CacheSnapshot, CachedTable, PreTransformChangeInfo, SchemaReductionCache};
pub use engine::{PreTransformEngine, TransformStats, TransformStatsSnapshot, STAGE_NAME};
pub use error::{ErrorCategory, Result, TransformError, TransformFailure};
pub use event::{
    ControlEvent, CreateTableEvent, DataChangeEvent, Event, OperationType, RowImage,
};
pub use expression::{
    CompileError, CompiledExpression, ExpressionCompiler, ProjectionItem, ProjectionKind,
    SqlExpressionCompiler, SupportedMetadataColumn, UdfDescriptor, UdfRegistry,
};
pub use projector::{project, ProjectionPlan};
pub use rule::{
    PostTransformConverter, SchemaMetadataTransform, TransformConfig, TransformConfigBuilder,
    TransformRule, TransformRuleConfig,
};
pub use schema::{Column, DataType, Schema, SchemaBuilder};
pub use selector::Selectors;
pub use table_id::{IdentifierCase, TableId};
