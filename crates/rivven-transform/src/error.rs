//! Error types for pre-transform operations
//!
//! Every failure raised while an event is being processed leaves the engine
//! wrapped in [`TransformError::Execution`], which carries the stage name, the
//! offending event and the schemas known for its table at the time.

use crate::event::Event;
use crate::expression::CompileError;
use crate::schema::Schema;
use crate::table_id::TableId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid rule declarations or options
    Configuration,
    /// Projection/filter expressions that do not compile
    Expression,
    /// Schema contract violations (missing or inconsistent schemas)
    Schema,
    /// Row images that do not fit their schema
    Data,
    /// Serialization errors (JSON, YAML)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Context attached to a failure while processing a single event.
#[derive(Debug)]
pub struct TransformFailure {
    /// Name of the stage that raised the error
    pub stage: &'static str,
    /// The event being processed
    pub event: Event,
    /// Table the event belongs to, if it is a table event
    pub table_id: Option<TableId>,
    /// Source schema cached for the table, if any
    pub source_schema: Option<Schema>,
    /// Reduced schema cached for the table, if any
    pub reduced_schema: Option<Schema>,
    /// The underlying error
    pub cause: TransformError,
}

impl std::fmt::Display for TransformFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to apply stage '{}' ", self.stage)?;
        match &self.table_id {
            Some(table_id) => write!(f, "to table {}", table_id)?,
            None => write!(f, "to {} event", self.event.kind())?,
        }
        write!(f, ": {}", self.cause)?;
        if let Some(schema) = &self.source_schema {
            write!(f, "; source schema: {}", schema)?;
        }
        if let Some(schema) = &self.reduced_schema {
            write!(f, "; reduced schema: {}", schema)?;
        }
        Ok(())
    }
}

/// Pre-transform errors
#[derive(Error, Debug)]
pub enum TransformError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Projection or filter expression failed to compile
    #[error("Rule compilation error: {0}")]
    Compilation(#[from] CompileError),

    /// Data change received for a table whose schema was never announced
    #[error(
        "Received a data change event from table {table_id} without a full schema view. \
         The source must emit a create table event for every table before its first \
         data change, including after fail-over"
    )]
    MissingSchema { table_id: TableId },

    /// Row image does not fit the schema it claims to be encoded against
    #[error("Row layout mismatch: schema has {expected} columns, row image has {actual} values")]
    RowLayout { expected: usize, actual: usize },

    /// Schema construction error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Failure while processing an event, with diagnostic context
    #[error("{0}")]
    Execution(Box<TransformFailure>),

    /// The engine has been shut down
    #[error("Transform engine is closed")]
    Closed,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransformError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a missing schema error
    pub fn missing_schema(table_id: TableId) -> Self {
        Self::MissingSchema { table_id }
    }

    /// Wrap an error with the context of the event that caused it.
    pub fn execution(
        stage: &'static str,
        event: Event,
        table_id: Option<TableId>,
        source_schema: Option<Schema>,
        reduced_schema: Option<Schema>,
        cause: TransformError,
    ) -> Self {
        Self::Execution(Box::new(TransformFailure {
            stage,
            event,
            table_id,
            source_schema,
            reduced_schema,
            cause,
        }))
    }

    /// Get the innermost error, unwrapping execution context.
    pub fn root_cause(&self) -> &TransformError {
        match self {
            Self::Execution(failure) => failure.cause.root_cause(),
            other => other,
        }
    }

    /// Get the execution context, if this error carries one.
    pub fn failure(&self) -> Option<&TransformFailure> {
        match self {
            Self::Execution(failure) => Some(failure),
            _ => None,
        }
    }

    /// Check whether the root cause is a missing schema.
    pub fn is_missing_schema(&self) -> bool {
        matches!(self.root_cause(), Self::MissingSchema { .. })
    }

    /// Check if this error is retriable.
    ///
    /// Rules and schemas are static for the lifetime of an engine, so
    /// re-processing the same event can never succeed.
    pub fn is_retriable(&self) -> bool {
        false
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Compilation(_) => ErrorCategory::Expression,
            Self::MissingSchema { .. } => ErrorCategory::Schema,
            Self::Schema(_) => ErrorCategory::Schema,
            Self::RowLayout { .. } => ErrorCategory::Data,
            Self::Execution(failure) => failure.cause.category(),
            Self::Closed => ErrorCategory::Other,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Yaml(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Compilation(_) => "rule_compilation_error",
            Self::MissingSchema { .. } => "missing_schema",
            Self::RowLayout { .. } => "row_layout_mismatch",
            Self::Schema(_) => "schema_error",
            Self::Execution(failure) => failure.cause.error_code(),
            Self::Closed => "closed",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Result type for pre-transform operations
pub type Result<T> = std::result::Result<T, TransformError>;
