//! Table identifiers
//!
//! A [`TableId`] has up to three parts: `namespace.schema.table`. Sources
//! decide which parts they populate (MySQL: `database.table`, PostgreSQL and
//! Oracle: `schema.table`, SQL Server: `database.schema.table`).

use crate::error::{Result, TransformError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// How a source normalizes identifier case before building table ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierCase {
    /// Keep identifiers as written
    #[default]
    Preserve,
    /// Upper-case identifiers (Oracle)
    Upper,
    /// Lower-case identifiers (PostgreSQL unquoted)
    Lower,
}

impl IdentifierCase {
    /// Apply this normalization to an identifier.
    pub fn apply(&self, ident: &str) -> String {
        match self {
            IdentifierCase::Preserve => ident.to_string(),
            IdentifierCase::Upper => ident.to_uppercase(),
            IdentifierCase::Lower => ident.to_lowercase(),
        }
    }
}

/// Identifier of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId {
    namespace: Option<String>,
    schema_name: Option<String>,
    table_name: String,
}

impl TableId {
    /// Create a table id with only a table name.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            schema_name: None,
            table_name: table_name.into(),
        }
    }

    /// Create a `schema.table` id.
    pub fn with_schema(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            schema_name: Some(schema_name.into()),
            table_name: table_name.into(),
        }
    }

    /// Create a `namespace.schema.table` id.
    pub fn full(
        namespace: impl Into<String>,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: Some(namespace.into()),
            schema_name: Some(schema_name.into()),
            table_name: table_name.into(),
        }
    }

    /// Parse a dotted identifier with one to three parts.
    ///
    /// `\.` is a literal dot inside a part and `\\` a literal backslash.
    pub fn parse(s: &str) -> Result<Self> {
        let parts = split_parts(s);
        let parts: Vec<&str> = parts.iter().map(|p| p.trim()).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(TransformError::config(format!(
                "Invalid table identifier '{}': empty part",
                s
            )));
        }
        match parts.as_slice() {
            [table] => Ok(Self::new(*table)),
            [schema, table] => Ok(Self::with_schema(*schema, *table)),
            [namespace, schema, table] => Ok(Self::full(*namespace, *schema, *table)),
            _ => Err(TransformError::config(format!(
                "Invalid table identifier '{}': expected at most 3 parts",
                s
            ))),
        }
    }

    /// Namespace (catalog/database), if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Schema name, if any.
    pub fn schema_name(&self) -> Option<&str> {
        self.schema_name.as_deref()
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Present identifier parts, outermost first.
    pub fn parts(&self) -> Vec<&str> {
        let mut parts = Vec::with_capacity(3);
        if let Some(ns) = &self.namespace {
            parts.push(ns.as_str());
        }
        if let Some(schema) = &self.schema_name {
            parts.push(schema.as_str());
        }
        parts.push(self.table_name.as_str());
        parts
    }
}

/// Split on unescaped `.`, resolving `\.` and `\\`.
fn split_parts(s: &str) -> Vec<String> {
    let mut parts = Vec::with_capacity(3);
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next @ ('.' | '\\')) => current.push(next),
                Some(next) => {
                    current.push('\\');
                    current.push(next);
                }
                None => current.push('\\'),
            },
            '.' => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    parts.push(current);
    parts
}

fn write_part(f: &mut fmt::Formatter<'_>, part: &str) -> fmt::Result {
    for c in part.chars() {
        match c {
            '.' => f.write_str("\\.")?,
            '\\' => f.write_str("\\\\")?,
            other => write!(f, "{}", other)?,
        }
    }
    Ok(())
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts().into_iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write_part(f, part)?;
        }
        Ok(())
    }
}

impl FromStr for TableId {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for TableId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TableId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
