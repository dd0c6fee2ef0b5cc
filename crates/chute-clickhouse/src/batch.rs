//! Per-key batching with dual size/time triggers
//!
//! Records are grouped by key. A key's batch is emitted as soon as it holds
//! `max_size` records, or once `timeout` has elapsed since its first record,
//! whichever comes first. When the input ends every non-empty batch is
//! emitted, oldest first.
//!
//! ```rust,ignore
//! use chute_clickhouse::batch::collect;
//!
//! let batches = collect(records, BatchPolicy::default());
//! futures::pin_mut!(batches);
//! while let Some(batch) = batches.next().await {
//!     // batch.items.len() <= 50
//! }
//! ```

use crate::config::BatchPolicy;
use crate::schema::{KeyedRecord, Row};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A non-empty group of records sharing one key
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<V = Row> {
    pub key: String,
    pub items: Vec<V>,
}

impl<V> Batch<V> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug)]
struct Pending<V> {
    items: Vec<V>,
    started: Instant,
    seq: u64,
}

/// Keyed accumulator behind [`collect`].
///
/// Time is passed in explicitly so the batcher itself never sleeps.
#[derive(Debug)]
pub struct Batcher<V = Row> {
    max_size: usize,
    timeout: Duration,
    pending: HashMap<String, Pending<V>>,
    next_seq: u64,
}

impl<V> Batcher<V> {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            max_size: policy.max_size.max(1),
            timeout: policy.timeout(),
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add a record; returns the key's batch if it just reached `max_size`.
    pub fn push(&mut self, record: KeyedRecord<V>) -> Option<Batch<V>> {
        self.push_at(record, Instant::now())
    }

    pub fn push_at(&mut self, record: KeyedRecord<V>, now: Instant) -> Option<Batch<V>> {
        let KeyedRecord { key, value } = record;
        let seq = self.next_seq;
        let pending = self.pending.entry(key.clone()).or_insert_with(|| Pending {
            items: Vec::new(),
            started: now,
            seq,
        });
        if pending.seq == seq {
            self.next_seq += 1;
        }
        pending.items.push(value);

        if pending.items.len() >= self.max_size {
            return self.take(&key);
        }
        None
    }

    /// Remove and return every batch whose deadline is at or before `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<Batch<V>> {
        let mut keys: Vec<(Instant, u64, String)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.started + self.timeout <= now)
            .map(|(k, p)| (p.started, p.seq, k.clone()))
            .collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|(_, _, key)| self.take(&key))
            .collect()
    }

    /// Earliest deadline among buffered batches.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.started + self.timeout)
            .min()
    }

    /// Remove and return all buffered batches, oldest first.
    pub fn drain(&mut self) -> Vec<Batch<V>> {
        let mut pending: Vec<(String, Pending<V>)> = self.pending.drain().collect();
        pending.sort_by_key(|(_, p)| (p.started, p.seq));
        pending
            .into_iter()
            .map(|(key, p)| Batch {
                key,
                items: p.items,
            })
            .collect()
    }

    /// Number of buffered records across all keys
    pub fn len(&self) -> usize {
        self.pending.values().map(|p| p.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of keys with a batch in progress
    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }

    fn take(&mut self, key: &str) -> Option<Batch<V>> {
        self.pending.remove(key).map(|p| Batch {
            key: key.to_string(),
            items: p.items,
        })
    }
}

enum Step<V> {
    Tick,
    Record(KeyedRecord<V>),
    End,
}

/// Turn a stream of keyed records into a stream of batches.
///
/// A batch is yielded when its key reaches `policy.max_size` records or
/// `policy.timeout` after its first record. On end of input the remaining
/// batches are flushed, oldest first.
pub fn collect<V, S>(records: S, policy: BatchPolicy) -> impl Stream<Item = Batch<V>>
where
    S: Stream<Item = KeyedRecord<V>>,
{
    async_stream::stream! {
        let mut batcher = Batcher::new(policy);
        let mut records = Box::pin(records);

        loop {
            let deadline = batcher.next_deadline();
            let step = tokio::select! {
                biased;

                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => Step::Tick,
                next = records.next() => match next {
                    Some(record) => Step::Record(record),
                    None => Step::End,
                },
            };

            match step {
                Step::Tick => {
                    for batch in batcher.expired(Instant::now()) {
                        yield batch;
                    }
                }
                Step::Record(record) => {
                    if let Some(batch) = batcher.push(record) {
                        yield batch;
                    }
                }
                Step::End => {
                    for batch in batcher.drain() {
                        yield batch;
                    }
                    break;
                }
            }
        }
    }
}
