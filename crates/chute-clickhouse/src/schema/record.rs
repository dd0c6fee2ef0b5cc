//! Record values and the Arrow record schema

use crate::error::{Result, SinkError};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// A single cell of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Short name used in conversion errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

macro_rules! impl_from {
    ($variant:ident: $($t:ty),+) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v.into())
                }
            }
        )+
    };
}

impl_from!(Bool: bool);
impl_from!(Int: i8, i16, i32, i64);
impl_from!(UInt: u8, u16, u32, u64);
impl_from!(Float: f32, f64);
impl_from!(String: String, &str);
impl_from!(Date: NaiveDate);
impl_from!(Timestamp: DateTime<Utc>);

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One record: values in record-schema field order.
pub type Row = Vec<Value>;

/// Build a [`Row`] from heterogeneous values.
///
/// ```
/// use chute_clickhouse::row;
/// let r = row!["cpu", 0.5_f64, 3_u32];
/// assert_eq!(r.len(), 3);
/// ```
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::Value::from($value)),*]
    };
}

/// A record paired with its routing key.
///
/// Batching happens per key; all records of a key go to the same partition.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord<V = Row> {
    pub key: String,
    pub value: V,
}

impl<V> KeyedRecord<V> {
    pub fn new(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

impl<V> From<(String, V)> for KeyedRecord<V> {
    fn from((key, value): (String, V)) -> Self {
        Self { key, value }
    }
}

impl<V> From<(&str, V)> for KeyedRecord<V> {
    fn from((key, value): (&str, V)) -> Self {
        Self::new(key, value)
    }
}

/// Ordered, uniquely named fields that every row must follow.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    schema: SchemaRef,
}

impl RecordSchema {
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Result<Self> {
        Self::from_arrow(Arc::new(Schema::new(fields.into_iter().collect::<Vec<_>>())))
    }

    pub fn from_arrow(schema: SchemaRef) -> Result<Self> {
        if schema.fields().is_empty() {
            return Err(SinkError::config("record schema has no fields"));
        }
        let mut seen = HashSet::new();
        for field in schema.fields() {
            if !seen.insert(field.name().as_str()) {
                return Err(SinkError::config(format!(
                    "duplicate field '{}' in record schema",
                    field.name()
                )));
            }
        }
        Ok(Self { schema })
    }

    pub fn arrow_schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.schema.fields().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schema.fields().is_empty()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.schema
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect()
    }
}

/// Map a ClickHouse type expression onto an Arrow type and nullability.
pub fn arrow_type_for(type_expr: &str) -> Result<(DataType, bool)> {
    let ty = base_type(type_expr);

    if let Some(inner) = unwrap_call(ty, "Nullable") {
        let (data_type, _) = arrow_type_for(inner)?;
        return Ok((data_type, true));
    }
    if let Some(inner) = unwrap_call(ty, "LowCardinality") {
        return arrow_type_for(inner);
    }
    if let Some(args) = unwrap_call(ty, "DateTime64") {
        let mut args = args.splitn(2, ',');
        let precision: u8 = args
            .next()
            .map(str::trim)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| unsupported(type_expr))?;
        let unit = match precision {
            0 => TimeUnit::Second,
            1..=3 => TimeUnit::Millisecond,
            4..=6 => TimeUnit::Microsecond,
            7..=9 => TimeUnit::Nanosecond,
            _ => return Err(unsupported(type_expr)),
        };
        let tz = args.next().map(unquote).map(Into::into);
        return Ok((DataType::Timestamp(unit, tz), false));
    }
    if let Some(args) = unwrap_call(ty, "DateTime") {
        let tz = Some(unquote(args)).filter(|t| !t.is_empty()).map(Into::into);
        return Ok((DataType::Timestamp(TimeUnit::Second, tz), false));
    }
    if unwrap_call(ty, "FixedString").is_some() {
        return Ok((DataType::Utf8, false));
    }

    let data_type = match ty {
        "String" => DataType::Utf8,
        "Bool" | "Boolean" => DataType::Boolean,
        "Int8" => DataType::Int8,
        "Int16" => DataType::Int16,
        "Int32" => DataType::Int32,
        "Int64" => DataType::Int64,
        "UInt8" => DataType::UInt8,
        "UInt16" => DataType::UInt16,
        "UInt32" => DataType::UInt32,
        "UInt64" => DataType::UInt64,
        "Float32" => DataType::Float32,
        "Float64" => DataType::Float64,
        "Date" | "Date32" => DataType::Date32,
        "DateTime" => DataType::Timestamp(TimeUnit::Second, None),
        _ => return Err(unsupported(type_expr)),
    };
    Ok((data_type, false))
}

fn unsupported(type_expr: &str) -> SinkError {
    SinkError::config(format!(
        "column type '{}' has no Arrow mapping",
        type_expr
    ))
}

/// Strip modifiers following the type (`CODEC(...)`, `DEFAULT ...`).
fn base_type(type_expr: &str) -> &str {
    let trimmed = type_expr.trim();
    let mut depth = 0i32;
    for (i, c) in trimmed.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            c if c.is_whitespace() && depth == 0 => return &trimmed[..i],
            _ => {}
        }
    }
    trimmed
}

/// `Name(args)` -> `args`
fn unwrap_call<'a>(ty: &'a str, name: &str) -> Option<&'a str> {
    ty.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('\'')
}
