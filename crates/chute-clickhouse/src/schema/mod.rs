//! Table descriptors and record schemas

mod ddl;
mod record;

pub use ddl::{parse_columns, parse_order_by, ColumnDef, TableDescriptor, DEDUP_ENGINE};
pub use record::{arrow_type_for, KeyedRecord, RecordSchema, Row, Value};
