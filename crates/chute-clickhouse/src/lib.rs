//! chute-clickhouse - batching ClickHouse sink for keyed record streams
//!
//! Keyed records are grouped into batches that close on size or on time,
//! transposed into Arrow record blocks and inserted into a ClickHouse table
//! with one request per batch. The destination table is checked (and created
//! as a `ReplacingMergeTree` when absent) once, when the sink is built, so
//! at-least-once redelivery upstream collapses into one row per key after
//! merges.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌─────────────┐   ┌─────────────────────┐
//! │ KeyedRecord  │──▶│ collect  │──▶│ RecordBlock │──▶│ ClickHousePartition │──▶ ClickHouse
//! │   stream     │   │ (batch)  │   │  (arrow)    │   │   (one per worker)  │
//! └──────────────┘   └──────────┘   └─────────────┘   └─────────────────────┘
//!                                                               ▲
//!                               ClickHouseSink ── Reconciler ───┘ (once, at build)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use chute_clickhouse::prelude::*;
//!
//! let config = SinkConfig::new("metrics", "admin", "password")
//!     .with_database("analytics")
//!     .with_schema("metric String, value Float64, ts DateTime64(6)")
//!     .with_order_by("metric, ts");
//!
//! let sink = ClickHouseSink::connect(config).await?;
//! let schema = sink.record_schema()?;
//! let stats = pipeline::output(&sink, schema, records, sink.batch_policy(), 4).await?;
//! ```

// Error types
pub mod error;

pub mod config;
pub mod schema;

// Batching and columnar conversion
pub mod batch;
pub mod block;

// ClickHouse access
pub mod client;
pub mod partition;
pub mod reconciler;
pub mod sink;

pub mod pipeline;

pub mod datagen;
pub mod telemetry;
pub mod testing;

pub use batch::{collect, Batch, Batcher};
pub use block::RecordBlock;
pub use client::{ClickHouseConnector, ColumnInfo, StoreClient, StoreConnector};
pub use config::{BatchPolicy, Compression, ConnectionConfig, Password, SinkConfig};
pub use error::{ConversionError, Result, SinkError};
pub use partition::ClickHousePartition;
pub use pipeline::FlushStats;
pub use reconciler::{Reconciler, Reconciliation};
pub use schema::{ColumnDef, KeyedRecord, RecordSchema, Row, TableDescriptor, Value};
pub use sink::{ClickHouseSink, ClickHouseSinkBuilder};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::pipeline;
    pub use crate::{
        collect, row, Batch, BatchPolicy, ClickHousePartition, ClickHouseSink, KeyedRecord,
        RecordBlock, RecordSchema, Result, Row, SinkConfig, SinkError, TableDescriptor, Value,
    };
}
