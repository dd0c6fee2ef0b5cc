//! In-memory ClickHouse stand-in for tests
//!
//! [`MemoryStore`] keeps tables, inserted blocks and connection counts in
//! shared state, so a test can hand a [`MemoryConnector`] to the sink builder
//! and inspect the store afterwards. [`MemoryStore::merge`] emulates a
//! `ReplacingMergeTree` background merge: rows sharing the ordering key
//! collapse to the most recently inserted one.
//!
//! # Example
//!
//! ```rust,ignore
//! use chute_clickhouse::testing::MemoryStore;
//!
//! let store = MemoryStore::new();
//! let sink = ClickHouseSink::builder(config)
//!     .connector(store.connector())
//!     .build()
//!     .await?;
//!
//! assert!(store.table_exists("analytics", "metrics"));
//! assert_eq!(store.insert_count(), 0);
//! ```

use crate::block::RecordBlock;
use crate::client::{ColumnInfo, StoreClient, StoreConnector};
use crate::config::{qualified_name, ConnectionConfig};
use crate::error::{Result, SinkError};
use crate::schema::{arrow_type_for, TableDescriptor, DEDUP_ENGINE};
use arrow::compute::take;
use arrow::util::display::array_value_to_string;
use arrow_array::{RecordBatch, UInt32Array};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Faults
// ============================================================================

/// One-shot failure to inject into the next matching call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Connection(String),
    Auth(String),
    Delivery(String),
    Schema(String),
}

impl Fault {
    fn into_error(self) -> SinkError {
        match self {
            Fault::Connection(msg) => SinkError::Connection(msg),
            Fault::Auth(msg) => SinkError::Auth(msg),
            Fault::Delivery(msg) => SinkError::Delivery(msg),
            Fault::Schema(msg) => SinkError::Schema(msg),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// A successful insert as seen by the store
#[derive(Debug, Clone, PartialEq)]
pub struct InsertCall {
    pub table: String,
    pub block: RecordBlock,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    engine: String,
    columns: Vec<ColumnInfo>,
    order_by: Vec<String>,
    blocks: Vec<RecordBlock>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    inserts: Vec<InsertCall>,
    insert_attempts: usize,
    ddl: Vec<String>,
    connects: usize,
    closes: usize,
    connect_fault: Option<Fault>,
    insert_fault: Option<Fault>,
}

/// Shared in-memory store; clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pre-existing table.
    pub fn with_table(
        self,
        database: &str,
        table: &str,
        engine: &str,
        columns: &[(&str, &str)],
        order_by: &[&str],
    ) -> Self {
        self.state.lock().tables.insert(
            qualified_name(database, table),
            MemoryTable {
                engine: engine.to_string(),
                columns: columns
                    .iter()
                    .map(|(name, ty)| ColumnInfo::new(*name, *ty))
                    .collect(),
                order_by: order_by.iter().map(|s| s.to_string()).collect(),
                blocks: Vec::new(),
            },
        );
        self
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    pub fn fail_next_connect(&self, fault: Fault) {
        self.state.lock().connect_fault = Some(fault);
    }

    pub fn fail_next_insert(&self, fault: Fault) {
        self.state.lock().insert_fault = Some(fault);
    }

    pub fn table_exists(&self, database: &str, table: &str) -> bool {
        self.state
            .lock()
            .tables
            .contains_key(&qualified_name(database, table))
    }

    pub fn engine(&self, database: &str, table: &str) -> Option<String> {
        self.state
            .lock()
            .tables
            .get(&qualified_name(database, table))
            .map(|t| t.engine.clone())
    }

    pub fn columns(&self, database: &str, table: &str) -> Vec<ColumnInfo> {
        self.state
            .lock()
            .tables
            .get(&qualified_name(database, table))
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    /// CREATE statements executed, in order
    pub fn ddl(&self) -> Vec<String> {
        self.state.lock().ddl.clone()
    }

    /// Successful inserts, in order
    pub fn inserts(&self) -> Vec<InsertCall> {
        self.state.lock().inserts.clone()
    }

    pub fn insert_count(&self) -> usize {
        self.state.lock().inserts.len()
    }

    /// Inserts attempted, including rejected ones
    pub fn insert_attempts(&self) -> usize {
        self.state.lock().insert_attempts
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().connects
    }

    pub fn connections_closed(&self) -> usize {
        self.state.lock().closes
    }

    /// Rows stored in a table before any merge
    pub fn row_count(&self, database: &str, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(&qualified_name(database, table))
            .map(|t| t.blocks.iter().map(RecordBlock::num_rows).sum())
            .unwrap_or(0)
    }

    /// Rows of a table after a `ReplacingMergeTree` style merge.
    ///
    /// Rows with equal ordering-key values collapse to the last inserted
    /// one; keys keep the order in which they were first seen. Tables with
    /// another engine, or without key, are returned unmerged.
    pub fn merge(&self, database: &str, table: &str) -> Result<Option<RecordBlock>> {
        let (blocks, order_by, engine) = {
            let state = self.state.lock();
            let Some(t) = state.tables.get(&qualified_name(database, table)) else {
                return Err(SinkError::schema(format!(
                    "Unknown table {}.{}",
                    database, table
                )));
            };
            (t.blocks.clone(), t.order_by.clone(), t.engine.clone())
        };
        if blocks.is_empty() {
            return Ok(None);
        }

        let all = RecordBlock::concat(&blocks)?;
        if order_by.is_empty() || !engine.contains(DEDUP_ENGINE) {
            return Ok(Some(all));
        }

        let batch = all.record_batch();
        let key_columns = order_by
            .iter()
            .map(|name| {
                batch.column_by_name(name).ok_or_else(|| {
                    SinkError::schema(format!("ordering column '{}' missing from rows", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut slots: HashMap<Vec<String>, usize> = HashMap::new();
        let mut kept: Vec<u32> = Vec::new();
        for row in 0..batch.num_rows() {
            let key = key_columns
                .iter()
                .map(|col| array_value_to_string(col, row))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| SinkError::schema(e.to_string()))?;
            match slots.get(&key) {
                Some(&slot) => kept[slot] = row as u32,
                None => {
                    slots.insert(key, kept.len());
                    kept.push(row as u32);
                }
            }
        }

        let indices = UInt32Array::from(kept);
        let columns = batch
            .columns()
            .iter()
            .map(|col| take(col.as_ref(), &indices, None))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SinkError::schema(e.to_string()))?;
        let merged = RecordBatch::try_new(batch.schema(), columns)
            .map_err(|e| SinkError::schema(e.to_string()))?;
        Ok(Some(RecordBlock::from_record_batch(merged)))
    }
}

// ============================================================================
// Connector / client
// ============================================================================

/// Opens [`MemoryClient`]s over a [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn StoreClient>> {
        let mut state = self.store.state.lock();
        if let Some(fault) = state.connect_fault.take() {
            return Err(fault.into_error());
        }
        state.connects += 1;
        Ok(Box::new(MemoryClient {
            store: self.store.clone(),
        }))
    }
}

/// One "connection" to a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryClient {
    store: MemoryStore,
}

#[async_trait]
impl StoreClient for MemoryClient {
    async fn table_exists(&self, database: &str, table: &str) -> Result<bool> {
        Ok(self.store.table_exists(database, table))
    }

    async fn create_table(&self, database: &str, descriptor: &TableDescriptor) -> Result<()> {
        let sql = descriptor.create_statement(database)?;
        let mut state = self.store.state.lock();
        state.ddl.push(sql);
        state
            .tables
            .entry(qualified_name(database, descriptor.name()))
            .or_insert_with(|| MemoryTable {
                engine: DEDUP_ENGINE.to_string(),
                columns: descriptor
                    .columns()
                    .iter()
                    .map(|c| ColumnInfo::new(&c.name, &c.type_expr))
                    .collect(),
                order_by: descriptor.order_by().to_vec(),
                blocks: Vec::new(),
            });
        Ok(())
    }

    async fn table_engine(&self, database: &str, table: &str) -> Result<Option<String>> {
        Ok(self.store.engine(database, table))
    }

    async fn table_columns(&self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(self.store.columns(database, table))
    }

    async fn insert_block(&self, qualified_table: &str, block: &RecordBlock) -> Result<()> {
        let mut state = self.store.state.lock();
        state.insert_attempts += 1;
        if let Some(fault) = state.insert_fault.take() {
            return Err(fault.into_error());
        }

        let table = state.tables.get_mut(qualified_table).ok_or_else(|| {
            SinkError::delivery(format!("Unknown table {}", qualified_table))
        })?;
        check_block_fits(&table.columns, block)?;
        table.blocks.push(block.clone());

        state.inserts.push(InsertCall {
            table: qualified_table.to_string(),
            block: block.clone(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.store.state.lock().closes += 1;
        Ok(())
    }
}

/// Server-side check: same column names in the same order, and a compatible
/// Arrow type wherever the column type has a mapping.
fn check_block_fits(columns: &[ColumnInfo], block: &RecordBlock) -> Result<()> {
    let schema = block.schema();
    if schema.fields().len() != columns.len() {
        return Err(SinkError::delivery(format!(
            "Expected column count {}, got {}",
            columns.len(),
            schema.fields().len()
        )));
    }
    for (column, field) in columns.iter().zip(schema.fields()) {
        if column.name != *field.name() {
            return Err(SinkError::delivery(format!(
                "No such column {} in table (expected column {})",
                field.name(),
                column.name
            )));
        }
        if let Ok((expected, _)) = arrow_type_for(&column.type_expr) {
            let compatible = match (&expected, field.data_type()) {
                (
                    arrow_schema::DataType::Timestamp(_, _),
                    arrow_schema::DataType::Timestamp(_, _),
                ) => true,
                (a, b) => a == b,
            };
            if !compatible {
                return Err(SinkError::delivery(format!(
                    "Type mismatch in column {}: table has {}, block has {}",
                    column.name,
                    column.type_expr,
                    field.data_type()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use crate::schema::RecordSchema;
    use arrow_array::cast::AsArray;
    use arrow_array::types::Float64Type;
    use arrow_schema::{DataType, Field};

    fn kv_schema() -> RecordSchema {
        RecordSchema::new([
            Field::new("k", DataType::Utf8, false),
            Field::new("v", DataType::Float64, false),
        ])
        .unwrap()
    }

    fn store_with_kv(engine: &str) -> MemoryStore {
        MemoryStore::new().with_table(
            "db",
            "kv",
            engine,
            &[("k", "String"), ("v", "Float64")],
            &["k"],
        )
    }

    #[tokio::test]
    async fn test_insert_and_merge_keeps_last_version() {
        let store = store_with_kv("ReplacingMergeTree");
        let client = store.connector().connect(&ConnectionConfig::new("u", "p")).await.unwrap();

        let first = RecordBlock::from_rows(&kv_schema(), &[row!["a", 1.0_f64], row!["b", 2.0_f64]])
            .unwrap();
        let second = RecordBlock::from_rows(&kv_schema(), &[row!["a", 3.0_f64]]).unwrap();
        client.insert_block("`db`.`kv`", &first).await.unwrap();
        client.insert_block("`db`.`kv`", &second).await.unwrap();

        assert_eq!(store.row_count("db", "kv"), 3);
        let merged = store.merge("db", "kv").unwrap().unwrap();
        assert_eq!(merged.num_rows(), 2);
        let v = merged.record_batch().column(1).as_primitive::<Float64Type>();
        assert_eq!(v.value(0), 3.0);
        assert_eq!(v.value(1), 2.0);
    }

    #[tokio::test]
    async fn test_merge_tree_keeps_duplicates() {
        let store = store_with_kv("MergeTree");
        let client = store.connector().connect(&ConnectionConfig::new("u", "p")).await.unwrap();
        let block = RecordBlock::from_rows(&kv_schema(), &[row!["a", 1.0_f64]]).unwrap();
        client.insert_block("`db`.`kv`", &block).await.unwrap();
        client.insert_block("`db`.`kv`", &block).await.unwrap();
        assert_eq!(store.merge("db", "kv").unwrap().unwrap().num_rows(), 2);
    }

    #[tokio::test]
    async fn test_insert_rejections() {
        let store = store_with_kv("ReplacingMergeTree");
        let client = store.connector().connect(&ConnectionConfig::new("u", "p")).await.unwrap();

        let wrong = RecordSchema::new([Field::new("k", DataType::Utf8, false)]).unwrap();
        let block = RecordBlock::from_rows(&wrong, &[row!["a"]]).unwrap();
        let err = client.insert_block("`db`.`kv`", &block).await.unwrap_err();
        assert!(matches!(err, SinkError::Delivery(_)));

        let mistyped = RecordSchema::new([
            Field::new("k", DataType::Utf8, false),
            Field::new("v", DataType::Utf8, false),
        ])
        .unwrap();
        let block = RecordBlock::from_rows(&mistyped, &[row!["a", "1.0"]]).unwrap();
        let err = client.insert_block("`db`.`kv`", &block).await.unwrap_err();
        assert!(matches!(err, SinkError::Delivery(_)), "{err:?}");

        let block = RecordBlock::from_rows(&kv_schema(), &[row!["a", 1.0_f64]]).unwrap();
        let err = client.insert_block("`db`.`missing`", &block).await.unwrap_err();
        assert!(matches!(err, SinkError::Delivery(_)));

        store.fail_next_insert(Fault::Delivery("Code: 241".into()));
        let err = client.insert_block("`db`.`kv`", &block).await.unwrap_err();
        assert!(matches!(err, SinkError::Delivery(_)));

        assert_eq!(store.insert_attempts(), 3);
        assert_eq!(store.insert_count(), 0);
        client.insert_block("`db`.`kv`", &block).await.unwrap();
        assert_eq!(store.insert_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_fault_and_counts() {
        let store = MemoryStore::new();
        store.fail_next_connect(Fault::Auth("Authentication failed".into()));
        let connector = store.connector();
        let config = ConnectionConfig::new("u", "p");

        assert!(matches!(
            connector.connect(&config).await,
            Err(SinkError::Auth(_))
        ));

        let client = connector.connect(&config).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(store.connections_opened(), 1);
        assert_eq!(store.connections_closed(), 1);
    }
}
