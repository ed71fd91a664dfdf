//! # Table Selectors
//!
//! A selector is a comma separated list of inclusion entries such as
//! `"db.orders, db.order_*, sales.*.invoices"`. Each entry is split on `.`
//! into up to three parts (`namespace.schema.table`) and matches a
//! [`TableId`] with the same number of parts when every part matches.
//!
//! A literal dot inside a part is written `\.`. With glob syntax it matches
//! a dot; with regex syntax it becomes the regex `.` so that `db.\.*`
//! selects every table of `db`.
//!
//! ```rust
//! use rivven_transform::selector::Selectors;
//! use rivven_transform::table_id::TableId;
//!
//! let selectors = Selectors::parse("db.orders, db.order_*").unwrap();
//! assert!(selectors.is_match(&TableId::with_schema("db", "orders")));
//! assert!(selectors.is_match(&TableId::with_schema("db", "order_items")));
//! assert!(!selectors.is_match(&TableId::with_schema("db", "customers")));
//! ```

use crate::error::{Result, TransformError};
use crate::pattern::{PatternMatcher, PatternSyntax};
use crate::table_id::TableId;

/// One `namespace.schema.table` entry.
#[derive(Debug, Clone)]
struct Selector {
    parts: Vec<PatternMatcher>,
}

impl Selector {
    fn is_match(&self, table_id: &TableId) -> bool {
        let id_parts = table_id.parts();
        id_parts.len() == self.parts.len()
            && self
                .parts
                .iter()
                .zip(id_parts)
                .all(|(pattern, part)| pattern.matches(part))
    }
}

/// Compiled table inclusion list.
#[derive(Debug, Clone)]
pub struct Selectors {
    expression: String,
    selectors: Vec<Selector>,
}

impl Selectors {
    /// Parse a case-insensitive glob selector list.
    pub fn parse(expression: &str) -> Result<Self> {
        Self::parse_with(expression, PatternSyntax::Glob, false)
    }

    /// Parse with explicit syntax and case sensitivity.
    pub fn parse_with(
        expression: &str,
        syntax: PatternSyntax,
        case_sensitive: bool,
    ) -> Result<Self> {
        let mut selectors = Vec::new();
        for entry in expression.split(',').map(str::trim) {
            if entry.is_empty() {
                return Err(TransformError::config(format!(
                    "Empty table selector in '{}'",
                    expression
                )));
            }

            let raw_parts = split_unescaped_dots(entry);
            if raw_parts.len() > 3 {
                return Err(TransformError::config(format!(
                    "Table selector '{}' has more than 3 parts",
                    entry
                )));
            }

            let parts = raw_parts
                .iter()
                .map(|part| {
                    PatternMatcher::with_options(part, syntax, case_sensitive).map_err(|e| {
                        TransformError::config(format!(
                            "Invalid table selector '{}': {}",
                            entry, e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            selectors.push(Selector { parts });
        }

        Ok(Self {
            expression: expression.to_string(),
            selectors,
        })
    }

    /// Check whether any entry matches the table.
    pub fn is_match(&self, table_id: &TableId) -> bool {
        self.selectors.iter().any(|s| s.is_match(table_id))
    }

    /// The expression this selector list was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }
}

impl std::fmt::Display for Selectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Split an entry on `.` that is not preceded by `\`; `\.` becomes `.`.
fn split_unescaped_dots(entry: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = entry.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                chars.next();
                current.push('.');
            }
            '.' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TableId {
        TableId::parse(s).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let selectors = Selectors::parse("db.orders").unwrap();
        assert!(selectors.is_match(&id("db.orders")));
        assert!(selectors.is_match(&id("DB.ORDERS")));
        assert!(!selectors.is_match(&id("db.order")));
        assert!(!selectors.is_match(&id("other.orders")));
    }

    #[test]
    fn test_part_count_must_agree() {
        let selectors = Selectors::parse("db.orders").unwrap();
        assert!(!selectors.is_match(&id("orders")));
        assert!(!selectors.is_match(&id("cat.db.orders")));

        let selectors = Selectors::parse("orders").unwrap();
        assert!(selectors.is_match(&id("orders")));
        assert!(!selectors.is_match(&id("db.orders")));
    }

    #[test]
    fn test_list_and_globs() {
        let selectors = Selectors::parse(" db.orders , sales.*, *.audit_?").unwrap();
        assert_eq!(selectors.len(), 3);
        assert!(selectors.is_match(&id("db.orders")));
        assert!(selectors.is_match(&id("sales.invoices")));
        assert!(selectors.is_match(&id("hr.audit_1")));
        assert!(!selectors.is_match(&id("hr.audit_12")));
        assert!(!selectors.is_match(&id("db.customers")));
    }

    #[test]
    fn test_three_parts() {
        let selectors = Selectors::parse("prod.*.orders").unwrap();
        assert!(selectors.is_match(&id("prod.sales.orders")));
        assert!(!selectors.is_match(&id("dev.sales.orders")));
    }

    #[test]
    fn test_escaped_dot_glob() {
        let selectors = Selectors::parse(r"db.v1\.orders").unwrap();
        assert!(selectors.is_match(&TableId::with_schema("db", "v1.orders")));
        assert!(!selectors.is_match(&TableId::with_schema("db", "v1xorders")));
    }

    #[test]
    fn test_regex_syntax() {
        let selectors = Selectors::parse_with(r"db.\.*", PatternSyntax::Regex, false).unwrap();
        assert!(selectors.is_match(&id("db.anything")));
        assert!(!selectors.is_match(&id("other.anything")));

        let selectors =
            Selectors::parse_with("db.order_[0-9]+", PatternSyntax::Regex, false).unwrap();
        assert!(selectors.is_match(&id("db.order_12")));
        assert!(!selectors.is_match(&id("db.order_x")));
    }

    #[test]
    fn test_case_sensitive() {
        let selectors = Selectors::parse_with("db.Orders", PatternSyntax::Glob, true).unwrap();
        assert!(selectors.is_match(&id("db.Orders")));
        assert!(!selectors.is_match(&id("db.orders")));
    }

    #[test]
    fn test_invalid() {
        assert!(Selectors::parse("").is_err());
        assert!(Selectors::parse("db.orders,,db.x").is_err());
        assert!(Selectors::parse("a.b.c.d").is_err());
        assert!(Selectors::parse("db.").is_err());
        assert!(Selectors::parse_with("db.[", PatternSyntax::Regex, false).is_err());
    }
}
