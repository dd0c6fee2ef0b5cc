//! Driving keyed record streams into partitions
//!
//! [`run_partition`] is the worker loop: batch, transpose, flush, repeat.
//! [`output`] fans one stream out to several workers, routing each key to a
//! fixed worker so per-key order is kept.

use crate::batch::collect;
use crate::block::RecordBlock;
use crate::config::BatchPolicy;
use crate::error::{Result, SinkError};
use crate::partition::ClickHousePartition;
use crate::schema::{KeyedRecord, RecordSchema, Row};
use crate::sink::ClickHouseSink;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

/// Step id given to partitions built by [`output`]
pub const OUTPUT_STEP_ID: &str = "clickhouse_output";

/// Counters for what a worker (or all workers) flushed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// Batches closed by the batcher
    pub batches: u64,
    /// Rows inserted
    pub records: u64,
}

impl FlushStats {
    pub fn merge(&mut self, other: FlushStats) {
        self.batches += other.batches;
        self.records += other.records;
    }
}

/// Batch `records`, convert each batch to a block and flush it.
///
/// Batches are flushed one at a time, in the order they close. The first
/// error stops the loop. The partition is closed on every exit path, after
/// any in-flight insert has finished.
pub async fn run_partition<S>(
    mut partition: ClickHousePartition,
    schema: RecordSchema,
    records: S,
    policy: BatchPolicy,
) -> Result<FlushStats>
where
    S: Stream<Item = KeyedRecord<Row>>,
{
    let span = partition.span().clone();
    let mut stats = FlushStats::default();

    let result = async {
        let batches = collect(records, policy);
        futures::pin_mut!(batches);

        while let Some(batch) = batches.next().await {
            let block = RecordBlock::from_rows(&schema, &batch.items).map_err(|e| {
                error!(key = %batch.key, rows = batch.len(), "Batch does not match the record schema: {}", e);
                SinkError::from(e)
            })?;
            let written = partition.write_batch(vec![block]).await?;
            stats.batches += 1;
            stats.records += written as u64;
        }
        Ok::<_, SinkError>(())
    }
    .instrument(span.clone())
    .await;

    let closed = partition.close().await;
    result?;
    closed?;

    info!(parent: &span, batches = stats.batches, records = stats.records, "Partition drained");
    Ok(stats)
}

/// Fan `records` out to `workers` partitions of `sink`.
///
/// Each worker runs [`run_partition`] on its own task with its own
/// connection. Records reach workers through bounded channels, so a slow
/// worker applies backpressure to the input. The first worker error stops
/// routing: the other workers drain what they already hold and close, and
/// that error is returned without consuming more input.
pub async fn output<S>(
    sink: &ClickHouseSink,
    schema: RecordSchema,
    records: S,
    policy: BatchPolicy,
    workers: usize,
) -> Result<FlushStats>
where
    S: Stream<Item = KeyedRecord<Row>>,
{
    let workers = workers.max(1);
    let capacity = policy.max_size.max(1);

    let mut partitions = Vec::with_capacity(workers);
    for index in 0..workers {
        match sink.build(OUTPUT_STEP_ID, index, workers).await {
            Ok(partition) => partitions.push(partition),
            Err(e) => {
                for partition in partitions {
                    if let Err(close) = partition.close().await {
                        warn!(parent: sink.span(), "Failed to close partition: {}", close);
                    }
                }
                return Err(e);
            }
        }
    }

    let mut senders = Vec::with_capacity(workers);
    let mut tasks = JoinSet::new();
    for (index, partition) in partitions.into_iter().enumerate() {
        let (tx, rx) = mpsc::channel::<KeyedRecord<Row>>(capacity);
        senders.push(tx);
        let worker = run_partition(partition, schema.clone(), receiver_stream(rx), policy);
        tasks.spawn(async move { (index, worker.await) });
    }

    let mut stats = FlushStats::default();
    let mut failure = None;
    let mut input_done = false;
    futures::pin_mut!(records);

    loop {
        tokio::select! {
            biased;
            Some(joined) = tasks.join_next() => match worker_outcome(sink, joined) {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            },
            next = records.next(), if !input_done => match next {
                Some(record) => {
                    let worker = worker_for(&record.key, workers);
                    if senders[worker].send(record).await.is_err() {
                        // Only a failed worker drops its receiver; its error
                        // is picked up by the next join.
                        debug!(parent: sink.span(), worker, "Worker stopped, no longer routing records");
                        input_done = true;
                        senders.clear();
                    }
                }
                None => {
                    input_done = true;
                    senders.clear();
                }
            },
            else => break,
        }
    }

    let Some(e) = failure else {
        return Ok(stats);
    };

    senders.clear();
    while let Some(joined) = tasks.join_next().await {
        let _ = worker_outcome(sink, joined);
    }
    Err(e)
}

fn worker_outcome(
    sink: &ClickHouseSink,
    joined: std::result::Result<(usize, Result<FlushStats>), JoinError>,
) -> Result<FlushStats> {
    match joined {
        Ok((_, Ok(stats))) => Ok(stats),
        Ok((index, Err(e))) => {
            error!(parent: sink.span(), worker = index, "Worker failed: {}", e);
            Err(e)
        }
        Err(join) => {
            error!(parent: sink.span(), "Worker task failed: {}", join);
            Err(SinkError::delivery(format!("worker task failed: {}", join)))
        }
    }
}

/// Stable worker assignment for a key.
pub fn worker_for(key: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    ((murmur2(key.as_bytes()) & 0x7fff_ffff) as usize) % workers
}

/// Murmur2 as the Kafka default partitioner computes it, so assignments do
/// not change between processes or releases.
fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;

    let mut h = SEED ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> 24;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M) ^ k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^ (h >> 15)
}

fn receiver_stream<T: Send + 'static>(mut rx: mpsc::Receiver<T>) -> impl Stream<Item = T> {
    async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    }
}
