//! Connections to the destination store
//!
//! The reconciler and partitions talk to ClickHouse through [`StoreClient`],
//! and obtain clients through a [`StoreConnector`]. [`ClickHouseConnector`]
//! is the production implementation; `testing::MemoryConnector` stands in for
//! it in tests.

mod http;

pub use http::{ClickHouseClient, ClickHouseConnector};

use crate::block::RecordBlock;
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::schema::TableDescriptor;
use async_trait::async_trait;

/// A column as reported by `system.columns`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_expr: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_expr: type_expr.into(),
        }
    }
}

/// One open connection to ClickHouse.
///
/// No method retries. Errors are classified into [`crate::SinkError`] and
/// returned to the caller as-is.
#[async_trait]
pub trait StoreClient: Send + Sync + std::fmt::Debug {
    async fn table_exists(&self, database: &str, table: &str) -> Result<bool>;

    /// Create the table described by `descriptor` inside `database`.
    async fn create_table(&self, database: &str, descriptor: &TableDescriptor) -> Result<()>;

    /// Engine name, or `None` when the table does not exist.
    async fn table_engine(&self, database: &str, table: &str) -> Result<Option<String>>;

    /// Columns in declaration order.
    async fn table_columns(&self, database: &str, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Insert a whole block in one request. `qualified_table` is
    /// `` `database`.`table` ``.
    async fn insert_block(&self, qualified_table: &str, block: &RecordBlock) -> Result<()>;

    /// Release the connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens [`StoreClient`]s from connection settings.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn StoreClient>>;
}
