//! # Table Schemas
//!
//! Immutable description of a table's physical row layout: ordered columns,
//! primary/partition keys and free-form table options. Column order defines
//! the position of each value in a [`RowImage`](crate::event::RowImage).
//!
//! ```rust
//! use rivven_transform::schema::{Column, DataType, Schema};
//!
//! let schema = Schema::builder()
//!     .column(Column::new("id", DataType::BigInt).with_nullable(false))
//!     .column(Column::new("amount", DataType::Decimal { precision: 10, scale: 2 }))
//!     .primary_key(["id"])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(schema.column_names(), vec!["id", "amount"]);
//! ```

use crate::error::{Result, TransformError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Data Types
// ============================================================================

/// SQL data type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Char(u32),
    Varchar(u32),
    String,
    Bytes,
    Date,
    Time,
    Timestamp(u8),
    TimestampLtz(u8),
}

impl DataType {
    /// Default precision for timestamp types.
    pub const DEFAULT_TIMESTAMP_PRECISION: u8 = 6;
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::TinyInt => write!(f, "TINYINT"),
            DataType::SmallInt => write!(f, "SMALLINT"),
            DataType::Int => write!(f, "INT"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Double => write!(f, "DOUBLE"),
            DataType::Decimal { precision, scale } => write!(f, "DECIMAL({}, {})", precision, scale),
            DataType::Char(n) => write!(f, "CHAR({})", n),
            DataType::Varchar(n) => write!(f, "VARCHAR({})", n),
            DataType::String => write!(f, "STRING"),
            DataType::Bytes => write!(f, "BYTES"),
            DataType::Date => write!(f, "DATE"),
            DataType::Time => write!(f, "TIME"),
            DataType::Timestamp(p) => write!(f, "TIMESTAMP({})", p),
            DataType::TimestampLtz(p) => write!(f, "TIMESTAMP_LTZ({})", p),
        }
    }
}

impl FromStr for DataType {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (name, args) = match trimmed.find('(') {
            Some(open) => {
                let close = trimmed.rfind(')').filter(|c| *c > open).ok_or_else(|| {
                    TransformError::schema(format!("Unbalanced parentheses in type '{}'", s))
                })?;
                let args = trimmed[open + 1..close]
                    .split(',')
                    .map(|a| {
                        a.trim().parse::<u32>().map_err(|_| {
                            TransformError::schema(format!("Invalid type argument in '{}'", s))
                        })
                    })
                    .collect::<Result<Vec<u32>>>()?;
                (trimmed[..open].trim().to_uppercase(), args)
            }
            None => (trimmed.to_uppercase(), Vec::new()),
        };

        let precision = |default: u8| -> Result<u8> {
            match args.first() {
                Some(p) => u8::try_from(*p)
                    .map_err(|_| TransformError::schema(format!("Precision out of range in '{}'", s))),
                None => Ok(default),
            }
        };

        let data_type = match name.as_str() {
            "BOOLEAN" | "BOOL" => DataType::Boolean,
            "TINYINT" => DataType::TinyInt,
            "SMALLINT" => DataType::SmallInt,
            "INT" | "INTEGER" => DataType::Int,
            "BIGINT" => DataType::BigInt,
            "FLOAT" | "REAL" => DataType::Float,
            "DOUBLE" => DataType::Double,
            "DECIMAL" | "NUMERIC" | "NUMBER" => DataType::Decimal {
                precision: precision(38)?,
                scale: match args.get(1) {
                    Some(scale) => u8::try_from(*scale).map_err(|_| {
                        TransformError::schema(format!("Scale out of range in '{}'", s))
                    })?,
                    None => 0,
                },
            },
            "CHAR" => DataType::Char(args.first().copied().unwrap_or(1)),
            "VARCHAR" | "VARCHAR2" => DataType::Varchar(args.first().copied().unwrap_or(u32::MAX)),
            "STRING" | "TEXT" | "CLOB" => DataType::String,
            "BYTES" | "BINARY" | "VARBINARY" | "BLOB" => DataType::Bytes,
            "DATE" => DataType::Date,
            "TIME" => DataType::Time,
            "TIMESTAMP" => DataType::Timestamp(precision(Self::DEFAULT_TIMESTAMP_PRECISION)?),
            "TIMESTAMP_LTZ" => {
                DataType::TimestampLtz(precision(Self::DEFAULT_TIMESTAMP_PRECISION)?)
            }
            _ => {
                return Err(TransformError::schema(format!(
                    "Unsupported data type '{}'",
                    s
                )))
            }
        };
        Ok(data_type)
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Column
// ============================================================================

/// A physical column. Identity within a schema is the column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// SQL type
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Is nullable
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Default value expression (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Column comment (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    /// Create a new nullable column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default_value: None,
            comment: None,
        }
    }

    /// Set nullable.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set default value.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default_value = Some(default.into());
        self
    }

    /// Set comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` {}", self.name, self.data_type)?;
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        if let Some(default) = &self.default_value {
            write!(f, " DEFAULT {}", default)?;
        }
        Ok(())
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Table schema. Never mutated once built; derive new schemas instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    primary_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    partition_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

impl Schema {
    /// Start building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Builder pre-populated with this schema's contents.
    pub fn to_builder(&self) -> SchemaBuilder {
        SchemaBuilder {
            columns: self.columns.clone(),
            primary_keys: self.primary_keys.clone(),
            partition_keys: self.partition_keys.clone(),
            options: self.options.clone(),
            comment: self.comment.clone(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn partition_keys(&self) -> &[String] {
        &self.partition_keys
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Copy this schema with a different column list, keeping all metadata.
    ///
    /// Primary keys are not re-validated: a reduced schema always keeps its
    /// primary-key columns.
    pub fn copy_with_columns(&self, columns: Vec<Column>) -> Schema {
        Schema {
            columns,
            primary_keys: self.primary_keys.clone(),
            partition_keys: self.partition_keys.clone(),
            options: self.options.clone(),
            comment: self.comment.clone(),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        write!(f, "columns={{{}}}", columns.join(","))?;
        write!(f, ", primaryKeys={}", self.primary_keys.join(";"))?;
        if !self.partition_keys.is_empty() {
            write!(f, ", partitionKeys={}", self.partition_keys.join(";"))?;
        }
        let options: Vec<String> = self
            .options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, ", options=({})", options.join(","))
    }
}

/// Builder for [`Schema`].
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    columns: Vec<Column>,
    primary_keys: Vec<String>,
    partition_keys: Vec<String>,
    options: BTreeMap<String, String>,
    comment: Option<String>,
}

impl SchemaBuilder {
    /// Append a column.
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Replace the column list.
    pub fn columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }

    /// Set primary key columns.
    pub fn primary_key<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set partition key columns.
    pub fn partition_key<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Add a table option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Replace all table options.
    pub fn options(mut self, options: BTreeMap<String, String>) -> Self {
        self.options = options;
        self
    }

    /// Set table comment.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Build the schema.
    ///
    /// Fails on duplicate column names or primary keys naming unknown columns.
    pub fn build(self) -> Result<Schema> {
        let mut seen = HashSet::with_capacity(self.columns.len());
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(TransformError::schema(format!(
                    "Duplicate column '{}'",
                    column.name
                )));
            }
        }
        if let Some(pk) = self.primary_keys.iter().find(|pk| !seen.contains(pk.as_str())) {
            return Err(TransformError::schema(format!(
                "Primary key column '{}' does not exist",
                pk
            )));
        }
        Ok(Schema {
            columns: self.columns,
            primary_keys: self.primary_keys,
            partition_keys: self.partition_keys,
            options: self.options,
            comment: self.comment,
        })
    }
}
