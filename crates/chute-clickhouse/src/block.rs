//! Columnar record blocks
//!
//! A [`RecordBlock`] is the transposition of one batch of rows into one Arrow
//! array per field, in record-schema order. Blocks are what partitions
//! concatenate and ship to ClickHouse as an Arrow IPC stream.
//!
//! Conversion is strict: a value is only stored in a column when it fits
//! without loss of meaning. Integers may widen or narrow when in range and may
//! be stored in float columns, dates may be stored in timestamp columns,
//! nulls only go into nullable fields. Anything else is a
//! [`ConversionError`] naming the row and field.

use crate::error::{ConversionError, Result, SinkError};
use crate::schema::{RecordSchema, Row, Value};
use arrow::compute::concat_batches;
use arrow::ipc::writer::StreamWriter;
use arrow_array::builder::{BooleanBuilder, PrimitiveBuilder, StringBuilder};
use arrow_array::types::{
    Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{ArrayRef, ArrowPrimitiveType, RecordBatch};
use arrow_schema::{ArrowError, DataType, Field, SchemaRef, TimeUnit};
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;

/// Days between 0001-01-01 (CE day 1) and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// One batch in columnar form
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBlock {
    batch: RecordBatch,
}

impl RecordBlock {
    /// Transpose `rows` into one column per field of `schema`.
    pub fn from_rows(
        schema: &RecordSchema,
        rows: &[Row],
    ) -> std::result::Result<Self, ConversionError> {
        let expected = schema.len();
        for (row, values) in rows.iter().enumerate() {
            if values.len() != expected {
                return Err(ConversionError::Arity {
                    row,
                    expected,
                    found: values.len(),
                });
            }
        }

        let arrow_schema = schema.arrow_schema();
        let columns = arrow_schema
            .fields()
            .iter()
            .enumerate()
            .map(|(index, field)| build_column(field, index, rows))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let batch = RecordBatch::try_new(arrow_schema.clone(), columns)?;
        Ok(Self { batch })
    }

    /// Wrap an existing Arrow batch.
    pub fn from_record_batch(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Concatenate blocks in order. All blocks must share one schema.
    pub fn concat(blocks: &[RecordBlock]) -> Result<Self> {
        let first = blocks
            .first()
            .ok_or_else(|| SinkError::schema("no record blocks to concatenate"))?;
        let schema = first.schema();

        for (i, block) in blocks.iter().enumerate().skip(1) {
            if block.schema().fields() != schema.fields() {
                return Err(SinkError::schema(format!(
                    "record block {} has schema {:?}, expected {:?}",
                    i,
                    field_summary(&block.schema()),
                    field_summary(&schema)
                )));
            }
        }

        if blocks.len() == 1 {
            return Ok(first.clone());
        }

        let batch = concat_batches(&schema, blocks.iter().map(|b| &b.batch))
            .map_err(|e| SinkError::schema(e.to_string()))?;
        Ok(Self { batch })
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.batch
    }

    /// Encode the block as an Arrow IPC stream (ClickHouse `ArrowStream` format).
    pub fn to_arrow_ipc(&self) -> std::result::Result<Vec<u8>, ArrowError> {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buf, &self.batch.schema())?;
            writer.write(&self.batch)?;
            writer.finish()?;
        }
        Ok(buf)
    }
}

fn field_summary(schema: &SchemaRef) -> Vec<String> {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect()
}

/// Why a single value was refused
enum Reject {
    Type,
    Overflow,
}

impl Reject {
    fn into_error(self, row: usize, field: &Field, value: &Value) -> ConversionError {
        match self {
            Reject::Type => ConversionError::Type {
                row,
                field: field.name().clone(),
                expected: field.data_type().clone(),
                found: value.type_name(),
            },
            Reject::Overflow => ConversionError::Overflow {
                row,
                field: field.name().clone(),
                value: format!("{:?}", value),
            },
        }
    }
}

fn build_column(
    field: &Field,
    index: usize,
    rows: &[Row],
) -> std::result::Result<ArrayRef, ConversionError> {
    match field.data_type() {
        DataType::Boolean => boolean_column(field, index, rows),
        DataType::Utf8 => string_column(field, index, rows),
        DataType::Int8 => primitive_column::<Int8Type, _>(field, index, rows, int_cell::<i8>),
        DataType::Int16 => primitive_column::<Int16Type, _>(field, index, rows, int_cell::<i16>),
        DataType::Int32 => primitive_column::<Int32Type, _>(field, index, rows, int_cell::<i32>),
        DataType::Int64 => primitive_column::<Int64Type, _>(field, index, rows, int_cell::<i64>),
        DataType::UInt8 => primitive_column::<UInt8Type, _>(field, index, rows, int_cell::<u8>),
        DataType::UInt16 => {
            primitive_column::<UInt16Type, _>(field, index, rows, int_cell::<u16>)
        }
        DataType::UInt32 => {
            primitive_column::<UInt32Type, _>(field, index, rows, int_cell::<u32>)
        }
        DataType::UInt64 => {
            primitive_column::<UInt64Type, _>(field, index, rows, int_cell::<u64>)
        }
        DataType::Float32 => primitive_column::<Float32Type, _>(field, index, rows, f32_cell),
        DataType::Float64 => primitive_column::<Float64Type, _>(field, index, rows, f64_cell),
        DataType::Date32 => primitive_column::<Date32Type, _>(field, index, rows, date32_cell),
        DataType::Timestamp(unit, _) => {
            let unit = *unit;
            match unit {
                TimeUnit::Second => primitive_column::<TimestampSecondType, _>(
                    field,
                    index,
                    rows,
                    |v| timestamp_cell(v, unit),
                ),
                TimeUnit::Millisecond => primitive_column::<TimestampMillisecondType, _>(
                    field,
                    index,
                    rows,
                    |v| timestamp_cell(v, unit),
                ),
                TimeUnit::Microsecond => primitive_column::<TimestampMicrosecondType, _>(
                    field,
                    index,
                    rows,
                    |v| timestamp_cell(v, unit),
                ),
                TimeUnit::Nanosecond => primitive_column::<TimestampNanosecondType, _>(
                    field,
                    index,
                    rows,
                    |v| timestamp_cell(v, unit),
                ),
            }
        }
        other => Err(ConversionError::UnsupportedType {
            field: field.name().clone(),
            data_type: other.clone(),
        }),
    }
}

fn null_check(field: &Field, row: usize) -> std::result::Result<(), ConversionError> {
    if field.is_nullable() {
        Ok(())
    } else {
        Err(ConversionError::Null {
            row,
            field: field.name().clone(),
        })
    }
}

fn primitive_column<T, F>(
    field: &Field,
    index: usize,
    rows: &[Row],
    convert: F,
) -> std::result::Result<ArrayRef, ConversionError>
where
    T: ArrowPrimitiveType,
    F: Fn(&Value) -> std::result::Result<T::Native, Reject>,
{
    let mut builder =
        PrimitiveBuilder::<T>::with_capacity(rows.len()).with_data_type(field.data_type().clone());
    for (row, values) in rows.iter().enumerate() {
        match &values[index] {
            Value::Null => {
                null_check(field, row)?;
                builder.append_null();
            }
            value => {
                let native = convert(value).map_err(|r| r.into_error(row, field, value))?;
                builder.append_value(native);
            }
        }
    }
    Ok(Arc::new(builder.finish()))
}

fn boolean_column(
    field: &Field,
    index: usize,
    rows: &[Row],
) -> std::result::Result<ArrayRef, ConversionError> {
    let mut builder = BooleanBuilder::with_capacity(rows.len());
    for (row, values) in rows.iter().enumerate() {
        match &values[index] {
            Value::Bool(b) => builder.append_value(*b),
            Value::Null => {
                null_check(field, row)?;
                builder.append_null();
            }
            other => return Err(Reject::Type.into_error(row, field, other)),
        }
    }
    Ok(Arc::new(builder.finish()))
}

fn string_column(
    field: &Field,
    index: usize,
    rows: &[Row],
) -> std::result::Result<ArrayRef, ConversionError> {
    let data_len = rows
        .iter()
        .map(|r| match &r[index] {
            Value::String(s) => s.len(),
            _ => 0,
        })
        .sum();
    let mut builder = StringBuilder::with_capacity(rows.len(), data_len);
    for (row, values) in rows.iter().enumerate() {
        match &values[index] {
            Value::String(s) => builder.append_value(s),
            Value::Null => {
                null_check(field, row)?;
                builder.append_null();
            }
            other => return Err(Reject::Type.into_error(row, field, other)),
        }
    }
    Ok(Arc::new(builder.finish()))
}

fn int_cell<N>(value: &Value) -> std::result::Result<N, Reject>
where
    N: TryFrom<i64> + TryFrom<u64>,
{
    match value {
        Value::Int(i) => N::try_from(*i).map_err(|_| Reject::Overflow),
        Value::UInt(u) => N::try_from(*u).map_err(|_| Reject::Overflow),
        _ => Err(Reject::Type),
    }
}

fn f64_cell(value: &Value) -> std::result::Result<f64, Reject> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        Value::UInt(u) => Ok(*u as f64),
        _ => Err(Reject::Type),
    }
}

fn f32_cell(value: &Value) -> std::result::Result<f32, Reject> {
    let f = f64_cell(value)?;
    if f.is_finite() && f.abs() > f32::MAX as f64 {
        return Err(Reject::Overflow);
    }
    Ok(f as f32)
}

fn date32_cell(value: &Value) -> std::result::Result<i32, Reject> {
    match value {
        Value::Date(d) => Ok(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
        _ => Err(Reject::Type),
    }
}

fn timestamp_cell(value: &Value, unit: TimeUnit) -> std::result::Result<i64, Reject> {
    let ts: DateTime<Utc> = match value {
        Value::Timestamp(ts) => *ts,
        Value::Date(d) => d
            .and_hms_opt(0, 0, 0)
            .ok_or(Reject::Overflow)?
            .and_utc(),
        _ => return Err(Reject::Type),
    };
    match unit {
        TimeUnit::Second => Ok(ts.timestamp()),
        TimeUnit::Millisecond => Ok(ts.timestamp_millis()),
        TimeUnit::Microsecond => Ok(ts.timestamp_micros()),
        TimeUnit::Nanosecond => ts.timestamp_nanos_opt().ok_or(Reject::Overflow),
    }
}
