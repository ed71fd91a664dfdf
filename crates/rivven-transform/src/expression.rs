//! # Projection and Filter Expressions
//!
//! The pre-transform only needs to know *which* source columns a rule's
//! projection and filter touch; evaluating the expressions happens later in
//! the pipeline. [`ExpressionCompiler`] is the seam to plug in a full SQL
//! front end; [`SqlExpressionCompiler`] is the built-in implementation that
//! tokenizes SQL-like expressions and extracts column references.
//!
//! Compilation is schema independent and happens once per rule when the
//! engine is built. Resolving identifiers against a concrete schema happens
//! per schema announcement via [`CompiledExpression::referenced_columns`].
//!
//! ```rust
//! use rivven_transform::expression::{ExpressionCompiler, SqlExpressionCompiler, UdfRegistry};
//!
//! let compiled = SqlExpressionCompiler::new()
//!     .compile(Some("id, UPPER(name) AS name_upper"), Some("amount > 100"), &UdfRegistry::default())
//!     .unwrap();
//!
//! assert!(!compiled.has_wildcard());
//! assert_eq!(compiled.identifiers(), vec!["id", "name", "amount"]);
//! ```

use crate::schema::{Column, DataType, Schema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

/// `__namespace_name__` metadata column
pub const NAMESPACE_NAME_COLUMN: &str = "__namespace_name__";
/// `__schema_name__` metadata column
pub const SCHEMA_NAME_COLUMN: &str = "__schema_name__";
/// `__table_name__` metadata column
pub const TABLE_NAME_COLUMN: &str = "__table_name__";
/// `__data_event_type__` metadata column
pub const DATA_EVENT_TYPE_COLUMN: &str = "__data_event_type__";

/// Metadata columns every rule may reference.
pub const BUILTIN_METADATA_COLUMNS: [&str; 4] = [
    NAMESPACE_NAME_COLUMN,
    SCHEMA_NAME_COLUMN,
    TABLE_NAME_COLUMN,
    DATA_EVENT_TYPE_COLUMN,
];

/// Non-physical column a source can provide (e.g. `op_ts`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SupportedMetadataColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

impl SupportedMetadataColumn {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Errors raised while compiling or resolving an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("Syntax error in expression '{expression}' at position {position}: {message}")]
    Syntax {
        expression: String,
        position: usize,
        message: String,
    },
    #[error("Unknown column '{column}' referenced in expression '{expression}'")]
    UnknownColumn { expression: String, column: String },
    #[error("Unknown function '{function}' in expression '{expression}'")]
    UnknownFunction {
        expression: String,
        function: String,
    },
}

impl CompileError {
    fn syntax(expression: &str, position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            expression: expression.to_string(),
            position,
            message: message.into(),
        }
    }

    /// The expression text that failed.
    pub fn expression(&self) -> &str {
        match self {
            Self::Syntax { expression, .. }
            | Self::UnknownColumn { expression, .. }
            | Self::UnknownFunction { expression, .. } => expression,
        }
    }
}

// ============================================================================
// User-defined functions
// ============================================================================

/// User-defined function declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdfDescriptor {
    /// Name used in expressions
    pub name: String,
    /// Implementation reference (class path, plugin symbol, ...)
    #[serde(alias = "classpath")]
    pub reference: String,
    /// Free-form parameters passed to the implementation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl UdfDescriptor {
    pub fn new(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reference: reference.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Registry of user-defined functions, keyed case-insensitively by name.
#[derive(Debug, Clone, Default)]
pub struct UdfRegistry {
    functions: HashMap<String, UdfDescriptor>,
}

impl UdfRegistry {
    /// Build a registry; returns the offending name on duplicates.
    pub fn new(descriptors: &[UdfDescriptor]) -> Result<Self, String> {
        let mut functions = HashMap::with_capacity(descriptors.len());
        for udf in descriptors {
            if functions
                .insert(udf.name.to_uppercase(), udf.clone())
                .is_some()
            {
                return Err(udf.name.clone());
            }
        }
        Ok(Self { functions })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(&name.to_uppercase())
    }

    pub fn get(&self, name: &str) -> Option<&UdfDescriptor> {
        self.functions.get(&name.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ============================================================================
// Compiled form
// ============================================================================

/// What a projection item produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionKind {
    /// `*` or `t.*`
    Wildcard,
    /// A bare column reference
    Column(String),
    /// Any other expression
    Computed,
}

/// One comma separated item of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionItem {
    /// Expression text without the alias
    pub expression: String,
    pub alias: Option<String>,
    pub kind: ProjectionKind,
    /// Column identifiers referenced by the expression, in order
    pub identifiers: Vec<String>,
}

impl ProjectionItem {
    /// Name of the produced column, if it has one.
    pub fn output_name(&self) -> Option<&str> {
        match (&self.alias, &self.kind) {
            (Some(alias), _) => Some(alias),
            (None, ProjectionKind::Column(name)) => Some(name),
            _ => None,
        }
    }
}

/// A compiled filter predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFilter {
    pub expression: String,
    /// Column identifiers referenced by the predicate, in order
    pub identifiers: Vec<String>,
}

/// Result of compiling one rule's projection and filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledExpression {
    projection: Vec<ProjectionItem>,
    filter: Option<CompiledFilter>,
}

impl CompiledExpression {
    pub fn new(projection: Vec<ProjectionItem>, filter: Option<CompiledFilter>) -> Self {
        Self { projection, filter }
    }

    pub fn projection(&self) -> &[ProjectionItem] {
        &self.projection
    }

    pub fn filter(&self) -> Option<&CompiledFilter> {
        self.filter.as_ref()
    }

    /// Whether the projection selects all columns.
    pub fn has_wildcard(&self) -> bool {
        self.projection
            .iter()
            .any(|item| item.kind == ProjectionKind::Wildcard)
    }

    /// All referenced identifiers (projection first, then filter), deduplicated.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.projection
            .iter()
            .flat_map(|item| item.identifiers.iter())
            .chain(self.filter.iter().flat_map(|f| f.identifiers.iter()))
            .map(String::as_str)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Resolve referenced identifiers to physical columns of `schema`.
    ///
    /// Metadata columns are skipped. A filter may reference projection
    /// aliases. With a wildcard every column of `schema` is returned.
    /// Columns come back in reference order without duplicates.
    pub fn referenced_columns(
        &self,
        schema: &Schema,
        metadata_columns: &[SupportedMetadataColumn],
    ) -> Result<Vec<Column>, CompileError> {
        if self.has_wildcard() {
            return Ok(schema.columns().to_vec());
        }

        let is_metadata = |name: &str| {
            BUILTIN_METADATA_COLUMNS.contains(&name)
                || metadata_columns.iter().any(|m| m.name == name)
        };
        let aliases: HashSet<&str> = self
            .projection
            .iter()
            .filter_map(|item| item.alias.as_deref())
            .collect();

        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        let mut resolve = |name: &str, expression: &str, allow_alias: bool| {
            if is_metadata(name) {
                return Ok(());
            }
            match lookup_column(schema, name) {
                Some(column) => {
                    if seen.insert(column.name.clone()) {
                        columns.push(column.clone());
                    }
                    Ok(())
                }
                None if allow_alias && aliases.contains(name) => Ok(()),
                None => Err(CompileError::UnknownColumn {
                    expression: expression.to_string(),
                    column: name.to_string(),
                }),
            }
        };

        for item in &self.projection {
            for name in &item.identifiers {
                resolve(name, &item.expression, false)?;
            }
        }
        if let Some(filter) = &self.filter {
            for name in &filter.identifiers {
                resolve(name, &filter.expression, true)?;
            }
        }
        Ok(columns)
    }
}

/// Exact name match first, then a case-insensitive one.
fn lookup_column<'a>(schema: &'a Schema, name: &str) -> Option<&'a Column> {
    schema.column(name).or_else(|| {
        schema
            .columns()
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    })
}

/// Compiles projection/filter expressions into their referenced columns.
pub trait ExpressionCompiler: Send + Sync + fmt::Debug {
    /// Compile a rule's projection and filter.
    ///
    /// A missing projection behaves like `*`; a missing or blank filter
    /// keeps every row.
    fn compile(
        &self,
        projection: Option<&str>,
        filter: Option<&str>,
        udfs: &UdfRegistry,
    ) -> Result<CompiledExpression, CompileError>;
}

// ============================================================================
// Built-in SQL-like compiler
// ============================================================================

static BUILTIN_FUNCTIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // numeric
        "ABS", "CEIL", "CEILING", "FLOOR", "ROUND", "TRUNCATE", "MOD", "POWER", "SQRT", "EXP",
        "LN", "LOG", "LOG10", "LOG2", "SIGN", "RAND",
        // string
        "UPPER", "LOWER", "CONCAT", "CONCAT_WS", "SUBSTR", "SUBSTRING", "TRIM", "LTRIM", "RTRIM",
        "CHAR_LENGTH", "CHARACTER_LENGTH", "LENGTH", "REPLACE", "REGEXP_REPLACE",
        "REGEXP_EXTRACT", "REGEXP", "LPAD", "RPAD", "POSITION", "LOCATE", "INITCAP", "REVERSE",
        "SPLIT_INDEX", "MD5", "SHA1", "SHA256", "HEX",
        // conditional
        "COALESCE", "IF", "NULLIF", "IFNULL", "GREATEST", "LEAST", "CAST", "TRY_CAST",
        // temporal
        "NOW", "CURRENT_TIMESTAMP", "LOCALTIMESTAMP", "CURRENT_DATE", "DATE_FORMAT", "TO_DATE",
        "TO_TIMESTAMP", "TO_TIMESTAMP_LTZ", "FROM_UNIXTIME", "UNIX_TIMESTAMP", "TIMESTAMPDIFF",
        "TIMESTAMPADD", "TIMESTAMP_DIFF", "DATE_ADD", "DATE_SUB", "DATEDIFF", "EXTRACT", "YEAR",
        "QUARTER", "MONTH", "WEEK", "DAYOFMONTH", "DAYOFYEAR", "HOUR", "MINUTE", "SECOND",
        // misc
        "UUID",
    ]
    .into_iter()
    .collect()
});

static KEYWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "AND", "OR", "NOT", "IS", "NULL", "TRUE", "FALSE", "UNKNOWN", "LIKE", "ESCAPE", "SIMILAR",
        "TO", "IN", "BETWEEN", "SYMMETRIC", "CASE", "WHEN", "THEN", "ELSE", "END", "AS",
        "DISTINCT", "FROM", "FOR", "BOTH", "LEADING", "TRAILING", "INTERVAL", "CURRENT_TIMESTAMP",
        "CURRENT_DATE", "CURRENT_TIME", "LOCALTIMESTAMP", "LOCALTIME",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident { name: String, quoted: bool },
    Str,
    Number,
    LParen,
    RParen,
    Comma,
    Star,
    Dot,
    Op,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    /// Byte offsets into the source expression
    start: usize,
    end: usize,
}

impl Token {
    fn keyword(&self) -> Option<String> {
        match &self.kind {
            TokenKind::Ident {
                name,
                quoted: false,
            } => {
                let upper = name.to_uppercase();
                KEYWORDS.contains(upper.as_str()).then_some(upper)
            }
            _ => None,
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        self.keyword().as_deref() == Some(keyword)
    }
}

/// Tokenizer and column extractor for SQL-like expressions.
#[derive(Debug, Clone, Default)]
pub struct SqlExpressionCompiler;

impl SqlExpressionCompiler {
    pub fn new() -> Self {
        Self
    }

    fn tokenize(expression: &str) -> Result<Vec<Token>, CompileError> {
        let bytes = expression.as_bytes();
        let mut tokens = Vec::new();
        let mut depth: i32 = 0;
        let mut i = 0;

        while i < bytes.len() {
            let c = bytes[i];
            let start = i;
            let kind = match c {
                b' ' | b'\t' | b'\n' | b'\r' => {
                    i += 1;
                    continue;
                }
                b'(' => {
                    depth += 1;
                    i += 1;
                    TokenKind::LParen
                }
                b')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(CompileError::syntax(expression, i, "unexpected ')'"));
                    }
                    i += 1;
                    TokenKind::RParen
                }
                b',' => {
                    i += 1;
                    TokenKind::Comma
                }
                b'*' => {
                    i += 1;
                    TokenKind::Star
                }
                b'.' if !bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                    i += 1;
                    TokenKind::Dot
                }
                b'\'' => {
                    i = Self::scan_quoted(expression, i, b'\'', "unterminated string literal")?;
                    TokenKind::Str
                }
                b'`' | b'"' => {
                    let end = Self::scan_quoted(expression, i, c, "unterminated quoted identifier")?;
                    let quote = c as char;
                    let doubled = format!("{}{}", quote, quote);
                    let name = expression[i + 1..end - 1].replace(&doubled, &quote.to_string());
                    if name.is_empty() {
                        return Err(CompileError::syntax(expression, i, "empty quoted identifier"));
                    }
                    i = end;
                    TokenKind::Ident { name, quoted: true }
                }
                c if c.is_ascii_digit() || c == b'.' => {
                    while i < bytes.len()
                        && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.')
                    {
                        i += 1;
                    }
                    TokenKind::Number
                }
                c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' || c >= 0x80 => {
                    while i < bytes.len()
                        && (bytes[i].is_ascii_alphanumeric()
                            || bytes[i] == b'_'
                            || bytes[i] == b'$'
                            || bytes[i] >= 0x80)
                    {
                        i += 1;
                    }
                    TokenKind::Ident {
                        name: expression[start..i].to_string(),
                        quoted: false,
                    }
                }
                b'+' | b'-' | b'/' | b'%' | b'=' | b'<' | b'>' | b'!' | b'|' | b'&' | b'^'
                | b'~' | b':' => {
                    i += 1;
                    while i < bytes.len()
                        && matches!(bytes[i], b'=' | b'<' | b'>' | b'|' | b':')
                        && i - start < 2
                    {
                        i += 1;
                    }
                    TokenKind::Op
                }
                _ => {
                    return Err(CompileError::syntax(
                        expression,
                        i,
                        format!("unexpected character '{}'", expression[i..].chars().next().unwrap_or('?')),
                    ))
                }
            };
            tokens.push(Token {
                kind,
                start,
                end: i,
            });
        }

        if depth != 0 {
            return Err(CompileError::syntax(
                expression,
                expression.len(),
                "unbalanced parentheses",
            ));
        }
        Ok(tokens)
    }

    /// Scan a quoted section starting at `start`; returns the offset after the
    /// closing quote. A doubled quote is an escaped quote.
    fn scan_quoted(
        expression: &str,
        start: usize,
        quote: u8,
        message: &str,
    ) -> Result<usize, CompileError> {
        let bytes = expression.as_bytes();
        let mut i = start + 1;
        while i < bytes.len() {
            if bytes[i] == quote {
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                    continue;
                }
                return Ok(i + 1);
            }
            i += 1;
        }
        Err(CompileError::syntax(expression, start, message))
    }

    /// Split tokens on top-level commas.
    fn split_items(tokens: &[Token]) -> Vec<&[Token]> {
        let mut items = Vec::new();
        let mut depth = 0usize;
        let mut item_start = 0;
        for (i, token) in tokens.iter().enumerate() {
            match token.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth = depth.saturating_sub(1),
                TokenKind::Comma if depth == 0 => {
                    items.push(&tokens[item_start..i]);
                    item_start = i + 1;
                }
                _ => {}
            }
        }
        items.push(&tokens[item_start..]);
        items
    }

    /// Index one past the `(...)` group opening at `open`.
    fn skip_group(tokens: &[Token], open: usize) -> usize {
        let mut depth = 0usize;
        for (i, token) in tokens.iter().enumerate().skip(open) {
            match token.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return i + 1;
                    }
                }
                _ => {}
            }
        }
        tokens.len()
    }

    /// Collect column identifiers from an expression's tokens.
    fn identifiers(
        expression: &str,
        tokens: &[Token],
        udfs: &UdfRegistry,
    ) -> Result<Vec<String>, CompileError> {
        let mut identifiers: Vec<String> = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let token = &tokens[i];
            let next = tokens.get(i + 1).map(|t| &t.kind);

            if token.is_keyword("AS") {
                // type name of a CAST, possibly with precision
                match tokens.get(i + 1) {
                    Some(Token {
                        kind: TokenKind::Ident { .. },
                        ..
                    }) => {
                        i += 2;
                        if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::LParen)) {
                            i = Self::skip_group(tokens, i);
                        }
                        continue;
                    }
                    _ => {
                        return Err(CompileError::syntax(
                            expression,
                            token.end,
                            "expected identifier after AS",
                        ))
                    }
                }
            }

            if token.is_keyword("INTERVAL") {
                // INTERVAL '1' DAY
                i += 1;
                if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Str)) {
                    i += 1;
                    if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Ident { .. })) {
                        i += 1;
                    }
                }
                continue;
            }

            if let TokenKind::Ident { name, quoted } = &token.kind {
                if !quoted && token.keyword().is_some() {
                    i += 1;
                    continue;
                }
                match next {
                    Some(TokenKind::LParen) if !quoted => {
                        let upper = name.to_uppercase();
                        if !BUILTIN_FUNCTIONS.contains(upper.as_str()) && !udfs.contains(name) {
                            return Err(CompileError::UnknownFunction {
                                expression: expression.to_string(),
                                function: name.clone(),
                            });
                        }
                        i += 2;
                        // EXTRACT(YEAR FROM ts): the unit is not a column
                        if upper == "EXTRACT"
                            && matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Ident { .. }))
                        {
                            i += 1;
                        }
                        continue;
                    }
                    Some(TokenKind::Dot) => {
                        // qualifier: `orders.id` references `id`
                        i += 2;
                        continue;
                    }
                    _ => {
                        if !identifiers.contains(name) {
                            identifiers.push(name.clone());
                        }
                    }
                }
            }
            i += 1;
        }
        Ok(identifiers)
    }

    fn compile_projection_item(
        expression: &str,
        tokens: &[Token],
        udfs: &UdfRegistry,
    ) -> Result<ProjectionItem, CompileError> {
        let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
            return Err(CompileError::syntax(
                expression,
                0,
                "empty projection item",
            ));
        };

        // trailing `AS alias`
        let (body, alias) = match tokens {
            [.., as_kw, alias_token] if as_kw.is_keyword("AS") && tokens.len() > 2 => {
                match &alias_token.kind {
                    TokenKind::Ident { name, .. } => (&tokens[..tokens.len() - 2], Some(name.clone())),
                    _ => {
                        return Err(CompileError::syntax(
                            expression,
                            alias_token.start,
                            "expected identifier after AS",
                        ))
                    }
                }
            }
            _ => (tokens, None),
        };

        let text_end = body.last().map(|t| t.end).unwrap_or(last.end);
        let text = expression[first.start..text_end].trim().to_string();

        let kind = match body {
            [star] if star.kind == TokenKind::Star => ProjectionKind::Wildcard,
            [qualifier, dot, star]
                if matches!(qualifier.kind, TokenKind::Ident { .. })
                    && dot.kind == TokenKind::Dot
                    && star.kind == TokenKind::Star =>
            {
                ProjectionKind::Wildcard
            }
            [single] => match &single.kind {
                TokenKind::Ident { name, .. } if single.keyword().is_none() => {
                    ProjectionKind::Column(name.clone())
                }
                _ => ProjectionKind::Computed,
            },
            _ => ProjectionKind::Computed,
        };

        if kind == ProjectionKind::Wildcard && alias.is_some() {
            return Err(CompileError::syntax(
                expression,
                first.start,
                "wildcard cannot be aliased",
            ));
        }

        let identifiers = match kind {
            ProjectionKind::Wildcard => Vec::new(),
            _ => Self::identifiers(expression, body, udfs)?,
        };

        Ok(ProjectionItem {
            expression: text,
            alias,
            kind,
            identifiers,
        })
    }
}

impl ExpressionCompiler for SqlExpressionCompiler {
    fn compile(
        &self,
        projection: Option<&str>,
        filter: Option<&str>,
        udfs: &UdfRegistry,
    ) -> Result<CompiledExpression, CompileError> {
        let projection = projection.map(str::trim).filter(|p| !p.is_empty()).unwrap_or("*");
        let tokens = Self::tokenize(projection)?;
        let items = Self::split_items(&tokens)
            .into_iter()
            .map(|item| Self::compile_projection_item(projection, item, udfs))
            .collect::<Result<Vec<_>, _>>()?;

        let filter = match filter.map(str::trim).filter(|f| !f.is_empty()) {
            Some(expression) => {
                let tokens = Self::tokenize(expression)?;
                if Self::split_items(&tokens).len() > 1 {
                    return Err(CompileError::syntax(
                        expression,
                        0,
                        "filter must be a single predicate",
                    ));
                }
                Some(CompiledFilter {
                    expression: expression.to_string(),
                    identifiers: Self::identifiers(expression, &tokens, udfs)?,
                })
            }
            None => None,
        };

        Ok(CompiledExpression::new(items, filter))
    }
}
