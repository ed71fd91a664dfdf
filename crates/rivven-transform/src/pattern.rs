//! # Identifier Patterns
//!
//! One part of a table selector (`namespace`, `schema` or `table`) compiled
//! into a matcher. Most selector parts are plain names, so literals are
//! compared directly and only parts with wildcards or regex syntax pay for a
//! regex.
//!
//! ```rust
//! use rivven_transform::pattern::{PatternMatcher, PatternSyntax};
//!
//! let part = PatternMatcher::new("order_*").unwrap();
//! assert!(part.matches("ORDER_ITEMS"));
//! assert!(!part.matches("customers"));
//!
//! let part = PatternMatcher::with_options("orders|refunds", PatternSyntax::Regex, true).unwrap();
//! assert!(part.matches("refunds"));
//! assert!(!part.matches("Refunds"));
//! ```

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// How selector parts are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSyntax {
    /// `*` for any run of characters, `?` for exactly one
    #[default]
    Glob,
    /// Anchored regular expression
    Regex,
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Selector part '{pattern}' is not a valid regex: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Selector part must not be empty")]
    EmptyPattern,
}

#[derive(Debug, Clone)]
enum Compiled {
    /// Matches every identifier
    Any,
    /// Plain name; lower-cased when matching ignores case
    Literal(String),
    Regex(Regex),
}

/// Compiled selector part.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    source: String,
    compiled: Compiled,
    case_sensitive: bool,
}

impl PatternMatcher {
    /// Compile a glob part that ignores case.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Self::with_options(pattern, PatternSyntax::Glob, false)
    }

    pub fn with_options(
        pattern: &str,
        syntax: PatternSyntax,
        case_sensitive: bool,
    ) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }

        let compiled = match syntax {
            PatternSyntax::Glob if pattern.chars().all(|c| c == '*') => Compiled::Any,
            PatternSyntax::Glob if !pattern.contains(['*', '?']) => {
                Compiled::Literal(fold_case(pattern, case_sensitive))
            }
            PatternSyntax::Glob => {
                Compiled::Regex(build_regex(pattern, &glob_to_regex(pattern), case_sensitive)?)
            }
            PatternSyntax::Regex if pattern == ".*" => Compiled::Any,
            PatternSyntax::Regex => Compiled::Regex(build_regex(
                pattern,
                &format!("^(?:{})$", pattern),
                case_sensitive,
            )?),
        };

        Ok(Self {
            source: pattern.to_string(),
            compiled,
            case_sensitive,
        })
    }

    /// Whether `identifier` matches the whole part.
    #[inline]
    pub fn matches(&self, identifier: &str) -> bool {
        match &self.compiled {
            Compiled::Any => true,
            Compiled::Literal(name) if self.case_sensitive => name == identifier,
            Compiled::Literal(name) => *name == identifier.to_lowercase(),
            Compiled::Regex(regex) => regex.is_match(identifier),
        }
    }

    /// The part as written.
    pub fn pattern(&self) -> &str {
        &self.source
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.compiled, Compiled::Any)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.compiled, Compiled::Literal(_))
    }
}

fn fold_case(name: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        name.to_string()
    } else {
        name.to_lowercase()
    }
}

fn build_regex(pattern: &str, regex: &str, case_sensitive: bool) -> Result<Regex, PatternError> {
    RegexBuilder::new(regex)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|source| PatternError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })
}

/// Anchored regex equivalent of a glob; everything but `*` and `?` is literal.
fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() + 8);
    regex.push('^');
    for c in glob.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    regex.push('$');
    regex
}
