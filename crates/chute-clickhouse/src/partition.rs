//! Per-worker flush coordinator
//!
//! A [`ClickHousePartition`] owns one store connection exclusively. Each call
//! to [`ClickHousePartition::write_batch`] turns the given blocks into exactly
//! one insert (or none for an empty call). Nothing is retried: a failure is
//! returned to the owning worker, which is expected to stop so the upstream
//! pipeline can redeliver from its last checkpoint.
//!
//! # Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `clickhouse.batches.success` | Counter | Inserts accepted by ClickHouse |
//! | `clickhouse.batches.failed` | Counter | Flushes that failed |
//! | `clickhouse.records.written` | Counter | Rows inserted |
//! | `clickhouse.records.failed` | Counter | Rows in failed flushes |
//! | `clickhouse.batch.size` | Gauge | Rows in the most recent flush |
//! | `clickhouse.batch.duration_ms` | Histogram | Insert latency |

use crate::block::RecordBlock;
use crate::client::StoreClient;
use crate::error::Result;
use metrics::{counter, gauge, histogram};
use std::time::Instant;
use tracing::{debug, error, Instrument, Span};

pub struct ClickHousePartition {
    client: Box<dyn StoreClient>,
    qualified_table: String,
    step_id: String,
    worker_index: usize,
    span: Span,
}

impl ClickHousePartition {
    pub(crate) fn new(
        client: Box<dyn StoreClient>,
        qualified_table: String,
        step_id: String,
        worker_index: usize,
        span: Span,
    ) -> Self {
        Self {
            client,
            qualified_table,
            step_id,
            worker_index,
            span,
        }
    }

    /// Concatenate `blocks` and insert them in a single request.
    ///
    /// Returns the number of rows inserted. An empty call (or one whose
    /// blocks hold no rows) issues no request. Blocks with differing schemas
    /// fail with a schema error before anything is sent.
    pub async fn write_batch(&mut self, blocks: Vec<RecordBlock>) -> Result<usize> {
        let span = self.span.clone();
        self.flush(blocks).instrument(span).await
    }

    async fn flush(&mut self, blocks: Vec<RecordBlock>) -> Result<usize> {
        if blocks.is_empty() {
            return Ok(0);
        }
        let rows: usize = blocks.iter().map(RecordBlock::num_rows).sum();

        let merged = match RecordBlock::concat(&blocks) {
            Ok(merged) => merged,
            Err(e) => {
                counter!("clickhouse.batches.failed").increment(1);
                counter!("clickhouse.records.failed").increment(rows as u64);
                error!(blocks = blocks.len(), rows, "Refusing to flush record blocks: {}", e);
                return Err(e);
            }
        };
        if merged.is_empty() {
            return Ok(0);
        }

        gauge!("clickhouse.batch.size").set(rows as f64);
        debug!(
            table = %self.qualified_table,
            blocks = blocks.len(),
            rows,
            "Flushing batch to ClickHouse"
        );

        let t0 = Instant::now();
        let result = self.client.insert_block(&self.qualified_table, &merged).await;
        histogram!("clickhouse.batch.duration_ms").record(t0.elapsed().as_millis() as f64);

        match result {
            Ok(()) => {
                counter!("clickhouse.batches.success").increment(1);
                counter!("clickhouse.records.written").increment(rows as u64);
                debug!(rows, "Batch inserted successfully");
                Ok(rows)
            }
            Err(e) => {
                counter!("clickhouse.batches.failed").increment(1);
                counter!("clickhouse.records.failed").increment(rows as u64);
                error!(rows, retryable = e.is_retryable(), "Failed to insert batch to ClickHouse: {}", e);
                Err(e)
            }
        }
    }

    /// Release the connection.
    pub async fn close(self) -> Result<()> {
        debug!(parent: &self.span, "Closing partition");
        self.client.close().await
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn qualified_table(&self) -> &str {
        &self.qualified_table
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl std::fmt::Debug for ClickHousePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHousePartition")
            .field("table", &self.qualified_table)
            .field("step_id", &self.step_id)
            .field("worker_index", &self.worker_index)
            .finish()
    }
}
