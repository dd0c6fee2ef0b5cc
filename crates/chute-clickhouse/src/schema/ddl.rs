//! Typed table descriptor and `CREATE TABLE` rendering
//!
//! The raw column list accepted in configuration (`metric String, value Float64`)
//! is parsed into [`ColumnDef`]s and validated before any SQL is generated.
//! Identifiers are checked against the identifier pattern and emitted
//! backtick-quoted; type expressions are restricted to a conservative
//! character set with balanced parentheses, so a column list can never close
//! the statement or append clauses of its own.

use super::record::{arrow_type_for, RecordSchema};
use crate::config::{validate_identifier, SinkConfig};
use crate::error::{Result, SinkError};
use arrow_schema::Field;
use std::collections::HashSet;
use std::fmt;

/// Engine created for new tables. Collapses rows that share the `ORDER BY`
/// key during background merges, which absorbs at-least-once redelivery.
pub const DEDUP_ENGINE: &str = "ReplacingMergeTree";

/// One column of the destination table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// ClickHouse type expression, e.g. `Nullable(String)` or `DateTime64(6)`
    pub type_expr: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, type_expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_expr: type_expr.into(),
        }
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` {}", self.name, self.type_expr)
    }
}

/// Destination table: name, declared columns and deduplication key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    name: String,
    columns: Vec<ColumnDef>,
    order_by: Vec<String>,
}

impl TableDescriptor {
    /// A descriptor with no declared columns (sufficient for an existing table).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            order_by: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, type_expr: impl Into<String>) -> Self {
        self.columns.push(ColumnDef::new(name, type_expr));
        self
    }

    pub fn with_order_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Build and validate a descriptor from the sink configuration.
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        let columns = match config.schema.as_deref() {
            Some(raw) => parse_columns(raw)?,
            None => Vec::new(),
        };
        let order_by = match config.order_by.as_deref() {
            Some(raw) => parse_order_by(raw)?,
            None => Vec::new(),
        };
        let descriptor = Self {
            name: config.table.clone(),
            columns,
            order_by,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn order_by(&self) -> &[String] {
        &self.order_by
    }

    pub fn has_columns(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Check identifiers, type expressions and the ordering key.
    pub fn validate(&self) -> Result<()> {
        validate_identifier("table", &self.name)?;

        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_identifier("column", &column.name)?;
            validate_type_expr(&column.name, &column.type_expr)?;
            if !seen.insert(column.name.as_str()) {
                return Err(SinkError::config(format!(
                    "duplicate column '{}' in schema of table '{}'",
                    column.name, self.name
                )));
            }
        }

        for key in &self.order_by {
            validate_identifier("order_by column", key)?;
            if !self.columns.is_empty() && !seen.contains(key.as_str()) {
                return Err(SinkError::config(format!(
                    "order_by column '{}' is not declared in the schema of table '{}'",
                    key, self.name
                )));
            }
        }
        Ok(())
    }

    /// Fail unless the descriptor carries enough to create the table.
    pub fn ensure_creatable(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(SinkError::config(format!(
                "missing schema for table creation: table '{}' does not exist; \
                 provide columns like `column1 UInt32, column2 String, column3 Date`",
                self.name
            )));
        }
        if self.order_by.is_empty() {
            return Err(SinkError::config(format!(
                "order_by is required to create table '{}': an empty key disables \
                 {} deduplication",
                self.name, DEDUP_ENGINE
            )));
        }
        Ok(())
    }

    /// `CREATE TABLE` statement for `database`.
    pub fn create_statement(&self, database: &str) -> Result<String> {
        validate_identifier("database", database)?;
        self.validate()?;
        self.ensure_creatable()?;

        let columns = self
            .columns
            .iter()
            .map(|c| format!("    {}", c))
            .collect::<Vec<_>>()
            .join(",\n");
        let order_by = self
            .order_by
            .iter()
            .map(|c| format!("`{}`", c))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS `{}`.`{}` (\n{}\n) ENGINE = {}() ORDER BY tuple({})",
            database, self.name, columns, DEDUP_ENGINE, order_by
        ))
    }

    /// Arrow record schema matching the declared ClickHouse column types.
    pub fn record_schema(&self) -> Result<RecordSchema> {
        let fields = self
            .columns
            .iter()
            .map(|c| {
                let (data_type, nullable) = arrow_type_for(&c.type_expr)?;
                Ok(Field::new(&c.name, data_type, nullable))
            })
            .collect::<Result<Vec<_>>>()?;
        RecordSchema::new(fields)
    }
}

/// Parse a raw column list such as `metric String, value Float64, ts DateTime,`.
///
/// Commas inside parentheses or quotes do not split columns; a trailing comma
/// and surrounding whitespace are accepted.
pub fn parse_columns(raw: &str) -> Result<Vec<ColumnDef>> {
    let mut columns = Vec::new();
    for part in split_top_level(raw)? {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, type_expr) = part
            .split_once(char::is_whitespace)
            .ok_or_else(|| SinkError::config(format!("column '{}' has no type", part)))?;
        let name = name.trim_matches('`');
        let type_expr = type_expr.split_whitespace().collect::<Vec<_>>().join(" ");
        columns.push(ColumnDef::new(name, type_expr));
    }
    Ok(columns)
}

/// Parse an ordering key such as `metric, ts`. Empty input yields no columns.
pub fn parse_order_by(raw: &str) -> Result<Vec<String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let name = s.trim_matches('`');
            validate_identifier("order_by column", name)?;
            Ok(name.to_string())
        })
        .collect()
}

/// Split on commas at parenthesis depth zero, outside single quotes.
fn split_top_level(raw: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut start = 0;

    for (i, c) in raw.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth -= 1,
            ',' if !in_quote && depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 {
            return Err(SinkError::config(format!(
                "unbalanced parentheses in schema '{}'",
                raw
            )));
        }
    }
    if depth != 0 || in_quote {
        return Err(SinkError::config(format!(
            "unterminated parenthesis or quote in schema '{}'",
            raw
        )));
    }
    parts.push(&raw[start..]);
    Ok(parts)
}

/// Restrict a type expression to what column declarations need.
fn validate_type_expr(column: &str, type_expr: &str) -> Result<()> {
    let invalid = |reason: &str| {
        SinkError::config(format!(
            "invalid type '{}' for column '{}': {}",
            type_expr, column, reason
        ))
    };

    if type_expr.trim().is_empty() {
        return Err(invalid("empty type"));
    }

    let mut depth = 0i32;
    let mut in_quote = false;
    for c in type_expr.chars() {
        if in_quote {
            match c {
                '\'' => in_quote = false,
                c if c.is_ascii_alphanumeric() || "_/-+:. ".contains(c) => {}
                _ => return Err(invalid("unsupported character in quoted literal")),
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(invalid("unbalanced parentheses"));
                }
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == ',' || c == ' ' => {}
            _ => return Err(invalid("unsupported character")),
        }
    }
    if depth != 0 || in_quote {
        return Err(invalid("unterminated parenthesis or quote"));
    }
    Ok(())
}
