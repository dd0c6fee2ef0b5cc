//! Random metric sources for demos and load tests
//!
//! Each source emits `(metric, value, ts)` rows at a fixed interval, with
//! `value` drawn uniformly from `[0, 10)`. [`metric_stream`] merges several
//! sources and keys every row under [`ALL_KEY`], so one batch collects rows
//! from all of them.

use crate::schema::{KeyedRecord, RecordSchema, Row, Value};
use arrow_schema::{DataType, Field, TimeUnit};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use std::time::Duration;

/// Column list of the demo table
pub const METRICS_DDL: &str = "metric String, value Float64, ts DateTime64(6)";

/// Deduplication key of the demo table
pub const METRICS_ORDER_BY: &str = "metric, ts";

/// Key shared by all demo rows
pub const ALL_KEY: &str = "All";

/// Default emission interval of a metric source
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(700);

/// Record schema matching [`METRICS_DDL`]
pub fn metrics_schema() -> RecordSchema {
    RecordSchema::new([
        Field::new("metric", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("ts", DataType::Timestamp(TimeUnit::Microsecond, None), false),
    ])
    .expect("metrics schema fields are unique - this is a bug")
}

/// Simple xorshift PRNG; no need for cryptographic randomness here.
#[derive(Debug, Clone)]
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x853c49e6748fea9b } else { seed },
        }
    }

    fn seeded_for(name: &str) -> Self {
        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let salt = name
            .bytes()
            .fold(0xcbf29ce484222325_u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
        Self::new(time ^ salt)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform in `[0, 1)`
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Configurable metric source
#[derive(Debug, Clone)]
pub struct MetricSource {
    name: String,
    interval: Duration,
    count: Option<usize>,
    seed: Option<u64>,
}

impl MetricSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: DEFAULT_INTERVAL,
            count: None,
            seed: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stop after `count` rows (unbounded by default).
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn into_stream(self) -> impl Stream<Item = Row> + Send + 'static {
        let MetricSource {
            name,
            interval,
            count,
            seed,
        } = self;
        let mut rng = seed.map(Rng::new).unwrap_or_else(|| Rng::seeded_for(&name));

        async_stream::stream! {
            let mut emitted = 0usize;
            while count.map_or(true, |limit| emitted < limit) {
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                let value = rng.next_f64() * 10.0;
                yield vec![
                    Value::String(name.clone()),
                    Value::Float(value),
                    Value::Timestamp(Utc::now()),
                ];
                emitted += 1;
            }
        }
    }
}

/// One unbounded source emitting every `interval`.
pub fn metric_source(
    name: impl Into<String>,
    interval: Duration,
) -> impl Stream<Item = Row> + Send + 'static {
    MetricSource::new(name).with_interval(interval).into_stream()
}

/// Name of the `index`-th demo source: `a_metric`, `b_metric`, ...
pub fn source_name(index: usize) -> String {
    if index < 26 {
        format!("{}_metric", (b'a' + index as u8) as char)
    } else {
        format!("metric_{}", index)
    }
}

/// Merge `sources` metric sources into one keyed stream.
///
/// `limit` caps the rows per source.
pub fn metric_stream(
    sources: usize,
    interval: Duration,
    limit: Option<usize>,
) -> impl Stream<Item = KeyedRecord> + Send + 'static {
    let streams = (0..sources).map(|i| {
        let mut source = MetricSource::new(source_name(i)).with_interval(interval);
        if let Some(limit) = limit {
            source = source.with_count(limit);
        }
        source.into_stream().boxed()
    });
    stream::select_all(streams).map(|row| KeyedRecord::new(ALL_KEY, row))
}
