//! # Transform Rules
//!
//! Rule declarations as they appear in a pipeline definition, and their
//! compiled form used by the cache builder.
//!
//! ```yaml
//! transforms:
//!   - source-table: db.orders
//!     projection: id, amount
//!     filter: amount > 100
//!     primary-keys: id
//!     table-options: bucket=4
//!     description: large orders only
//! udfs:
//!   - name: add_one
//!     reference: com.example.AddOne
//! ```
//!
//! Values may reference environment variables as `${VAR}` or
//! `${VAR:-default}`.

use crate::error::{Result, TransformError};
use crate::expression::{
    CompiledExpression, ExpressionCompiler, SqlExpressionCompiler, SupportedMetadataColumn,
    UdfDescriptor, UdfRegistry,
};
use crate::pattern::PatternSyntax;
use crate::schema::Schema;
use crate::selector::Selectors;
use crate::table_id::{IdentifierCase, TableId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

// ============================================================================
// Declarations
// ============================================================================

/// One `transforms` entry of a pipeline definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransformRuleConfig {
    /// Table selector list, e.g. `db.orders, db.order_*`
    pub source_table: String,
    /// Projection; absent means `*`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Comma separated primary key override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_keys: Option<String>,
    /// Comma separated partition key override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_keys: Option<String>,
    /// `k=v` pairs separated by commas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter_after_transform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Non-physical columns the source provides for this rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata_columns: Vec<SupportedMetadataColumn>,
}

impl TransformRuleConfig {
    pub fn new(source_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            ..Default::default()
        }
    }

    pub fn with_projection(mut self, projection: impl Into<String>) -> Self {
        self.projection = Some(projection.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_primary_keys(mut self, keys: impl Into<String>) -> Self {
        self.primary_keys = Some(keys.into());
        self
    }

    pub fn with_partition_keys(mut self, keys: impl Into<String>) -> Self {
        self.partition_keys = Some(keys.into());
        self
    }

    pub fn with_table_options(mut self, options: impl Into<String>) -> Self {
        self.table_options = Some(options.into());
        self
    }

    pub fn with_converter(mut self, converter: impl Into<String>) -> Self {
        self.converter_after_transform = Some(converter.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata_column(mut self, column: SupportedMetadataColumn) -> Self {
        self.metadata_columns.push(column);
        self
    }
}

/// Converter applied to records after the transform stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostTransformConverter {
    /// Turn deletes into inserts flagged as deleted
    SoftDelete,
    /// Lower-case all field names
    FieldNameLowerCase,
}

impl PostTransformConverter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoftDelete => "SOFT_DELETE",
            Self::FieldNameLowerCase => "FIELD_NAME_LOWER_CASE",
        }
    }
}

impl FromStr for PostTransformConverter {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "SOFT_DELETE" => Ok(Self::SoftDelete),
            "FIELD_NAME_LOWER_CASE" => Ok(Self::FieldNameLowerCase),
            other => Err(TransformError::config(format!(
                "Unknown post-transform converter '{}', expected SOFT_DELETE or FIELD_NAME_LOWER_CASE",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PostTransformConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Schema metadata overrides
// ============================================================================

/// Primary key, partition key and table option overrides of one rule.
///
/// Empty fields inherit whatever the schema already carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMetadataTransform {
    pub primary_keys: Vec<String>,
    pub partition_keys: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl SchemaMetadataTransform {
    /// Parse the raw override strings of a rule.
    pub fn parse(
        primary_keys: Option<&str>,
        partition_keys: Option<&str>,
        table_options: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            primary_keys: split_list(primary_keys),
            partition_keys: split_list(partition_keys),
            options: parse_table_options(table_options.unwrap_or_default())?,
        })
    }

    /// True when the rule overrides nothing.
    pub fn is_empty(&self) -> bool {
        self.primary_keys.is_empty() && self.partition_keys.is_empty() && self.options.is_empty()
    }

    /// Apply the non-empty overrides to `schema`.
    ///
    /// Fails when an overridden primary key names a column `schema` lacks.
    pub fn apply(&self, schema: &Schema) -> Result<Schema> {
        if self.is_empty() {
            return Ok(schema.clone());
        }
        let mut builder = schema.to_builder();
        if !self.primary_keys.is_empty() {
            builder = builder.primary_key(self.primary_keys.iter().cloned());
        }
        if !self.partition_keys.is_empty() {
            builder = builder.partition_key(self.partition_keys.iter().cloned());
        }
        if !self.options.is_empty() {
            builder = builder.options(self.options.clone());
        }
        builder.build()
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

/// Parse `k1=v1,k2=v2`.
fn parse_table_options(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            TransformError::config(format!(
                "Invalid table option '{}', expected key=value",
                pair
            ))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(TransformError::config(format!(
                "Invalid table option '{}': empty key",
                pair
            )));
        }
        options.insert(key.to_string(), value.trim().to_string());
    }
    Ok(options)
}

// ============================================================================
// Compiled rule
// ============================================================================

/// A validated, compiled transform rule.
#[derive(Debug, Clone)]
pub struct TransformRule {
    config: TransformRuleConfig,
    selectors: Selectors,
    expression: CompiledExpression,
    metadata: SchemaMetadataTransform,
    converter: Option<PostTransformConverter>,
}

impl TransformRule {
    /// Compile a declaration.
    pub fn compile(
        config: &TransformRuleConfig,
        compiler: &dyn ExpressionCompiler,
        udfs: &UdfRegistry,
        options: &SelectorOptions,
    ) -> Result<Self> {
        if config.source_table.trim().is_empty() {
            return Err(TransformError::config("source-table must not be empty"));
        }
        // regex entries are left alone: case-mapping would change escapes like `\d`
        let source_table = match options.syntax {
            PatternSyntax::Glob => options.identifier_case.apply(&config.source_table),
            PatternSyntax::Regex => config.source_table.clone(),
        };
        let selectors =
            Selectors::parse_with(&source_table, options.syntax, options.case_sensitive)?;
        let metadata = SchemaMetadataTransform::parse(
            config.primary_keys.as_deref(),
            config.partition_keys.as_deref(),
            config.table_options.as_deref(),
        )?;
        let converter = config
            .converter_after_transform
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::parse::<PostTransformConverter>)
            .transpose()?;
        let expression =
            compiler.compile(config.projection.as_deref(), config.filter.as_deref(), udfs)?;

        Ok(Self {
            config: config.clone(),
            selectors,
            expression,
            metadata,
            converter,
        })
    }

    /// Whether this rule applies to `table_id`.
    pub fn matches(&self, table_id: &TableId) -> bool {
        self.selectors.is_match(table_id)
    }

    pub fn config(&self) -> &TransformRuleConfig {
        &self.config
    }

    pub fn selectors(&self) -> &Selectors {
        &self.selectors
    }

    pub fn expression(&self) -> &CompiledExpression {
        &self.expression
    }

    pub fn metadata(&self) -> &SchemaMetadataTransform {
        &self.metadata
    }

    pub fn converter(&self) -> Option<PostTransformConverter> {
        self.converter
    }

    pub fn metadata_columns(&self) -> &[SupportedMetadataColumn] {
        &self.config.metadata_columns
    }

    pub fn has_wildcard(&self) -> bool {
        self.expression.has_wildcard()
    }
}

/// How selector entries are compiled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectorOptions {
    pub syntax: PatternSyntax,
    pub case_sensitive: bool,
    /// Case the source applies to identifiers; glob entries get the same
    pub identifier_case: IdentifierCase,
}

// ============================================================================
// Top-level configuration
// ============================================================================

/// Immutable pre-transform configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransformConfig {
    /// Rules in declaration order
    #[serde(default)]
    pub transforms: Vec<TransformRuleConfig>,
    #[serde(default)]
    pub udfs: Vec<UdfDescriptor>,
    #[serde(default)]
    pub identifier_case: IdentifierCase,
    #[serde(default)]
    pub case_sensitive_selectors: bool,
    #[serde(default)]
    pub selector_syntax: PatternSyntax,
}

impl TransformConfig {
    pub fn builder() -> TransformConfigBuilder {
        TransformConfigBuilder::default()
    }

    /// Load and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate YAML, expanding environment variables first.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    pub fn selector_options(&self) -> SelectorOptions {
        SelectorOptions {
            syntax: self.selector_syntax,
            case_sensitive: self.case_sensitive_selectors,
            identifier_case: self.identifier_case,
        }
    }

    /// Build the UDF registry, rejecting blank and duplicate names.
    pub fn udf_registry(&self) -> Result<UdfRegistry> {
        if let Some(udf) = self.udfs.iter().find(|u| u.name.trim().is_empty()) {
            return Err(TransformError::config(format!(
                "UDF with reference '{}' has an empty name",
                udf.reference
            )));
        }
        UdfRegistry::new(&self.udfs)
            .map_err(|name| TransformError::config(format!("Duplicate UDF name '{}'", name)))
    }

    /// Validate with the built-in expression compiler.
    pub fn validate(&self) -> Result<()> {
        self.validate_with(&SqlExpressionCompiler::new())
    }

    /// Validate every rule by compiling it.
    pub fn validate_with(&self, compiler: &dyn ExpressionCompiler) -> Result<()> {
        self.compile_rules(compiler).map(|_| ())
    }

    /// Compile all rules in declaration order.
    pub fn compile_rules(&self, compiler: &dyn ExpressionCompiler) -> Result<Vec<TransformRule>> {
        let udfs = self.udf_registry()?;
        let options = self.selector_options();
        self.transforms
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                TransformRule::compile(rule, compiler, &udfs, &options).map_err(|e| match e {
                    TransformError::Config(msg) => TransformError::config(format!(
                        "Transform #{} ({}): {}",
                        index + 1,
                        rule.source_table,
                        msg
                    )),
                    other => other,
                })
            })
            .collect()
    }
}

/// Accumulates rules and UDFs, then produces a validated [`TransformConfig`].
#[derive(Debug, Default)]
pub struct TransformConfigBuilder {
    config: TransformConfig,
}

impl TransformConfigBuilder {
    pub fn transform(mut self, rule: TransformRuleConfig) -> Self {
        self.config.transforms.push(rule);
        self
    }

    pub fn transforms(mut self, rules: impl IntoIterator<Item = TransformRuleConfig>) -> Self {
        self.config.transforms.extend(rules);
        self
    }

    pub fn udf(mut self, udf: UdfDescriptor) -> Self {
        self.config.udfs.push(udf);
        self
    }

    pub fn udfs(mut self, udfs: impl IntoIterator<Item = UdfDescriptor>) -> Self {
        self.config.udfs.extend(udfs);
        self
    }

    pub fn identifier_case(mut self, case: IdentifierCase) -> Self {
        self.config.identifier_case = case;
        self
    }

    pub fn case_sensitive_selectors(mut self, case_sensitive: bool) -> Self {
        self.config.case_sensitive_selectors = case_sensitive;
        self
    }

    pub fn selector_syntax(mut self, syntax: PatternSyntax) -> Self {
        self.config.selector_syntax = syntax;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<TransformConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
