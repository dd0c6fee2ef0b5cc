//! Batching, flushing and fan-out against the in-memory store
//!
//! Time-based tests run on a paused tokio clock, so the 5 second timeout
//! elapses instantly.
//!
//! Run with: cargo test -p chute-clickhouse --test pipeline_test

use arrow_array::cast::AsArray;
use arrow_array::types::Float64Type;
use arrow_schema::{DataType, Field};
use chute_clickhouse::datagen::{metrics_schema, MetricSource, ALL_KEY, METRICS_DDL, METRICS_ORDER_BY};
use chute_clickhouse::pipeline::{self, run_partition};
use chute_clickhouse::testing::{Fault, MemoryStore};
use chute_clickhouse::{
    row, BatchPolicy, ClickHouseSink, KeyedRecord, RecordBlock, RecordSchema, Row, SinkConfig,
    SinkError,
};
use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn metrics_config() -> SinkConfig {
    SinkConfig::new("metrics", "admin", "password")
        .with_database("analytics")
        .with_schema(METRICS_DDL)
        .with_order_by(METRICS_ORDER_BY)
        .with_batch(BatchPolicy::new(50, Duration::from_secs(5)))
}

async fn metrics_sink(store: &MemoryStore) -> ClickHouseSink {
    ClickHouseSink::builder(metrics_config())
        .connector(store.connector())
        .build()
        .await
        .unwrap()
}

fn metric_row(name: &str, value: f64, secs: i64) -> Row {
    row![name, value, Utc.timestamp_opt(secs, 0).unwrap()]
}

/// Three sources emitting `counts[i]` rows each, keyed "All", never ending.
fn three_sources(counts: [usize; 3]) -> impl futures::Stream<Item = KeyedRecord> + Send {
    let sources = ["a_metric", "b_metric", "c_metric"]
        .into_iter()
        .zip(counts)
        .map(|(name, count)| {
            MetricSource::new(name)
                .with_interval(Duration::from_millis(20))
                .with_count(count)
                .with_seed(count as u64 + 1)
                .into_stream()
                .boxed()
        });
    stream::select_all(sources)
        .map(|row| KeyedRecord::new(ALL_KEY, row))
        .chain(stream::pending())
}

#[tokio::test(start_paused = true)]
async fn test_three_sources_fifty_records_single_insert() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let partition = sink.build("clickhouse_out", 0, 1).await.unwrap();

    let start = Instant::now();
    let worker = tokio::spawn(run_partition(
        partition,
        metrics_schema(),
        three_sources([17, 17, 16]),
        sink.batch_policy(),
    ));

    // All 50 rows arrive within well under a second
    sleep(Duration::from_secs(1)).await;
    assert!(start.elapsed() < Duration::from_secs(5));

    let inserts = store.inserts();
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].table, "`analytics`.`metrics`");
    assert_eq!(inserts[0].block.num_rows(), 50);
    assert_eq!(inserts[0].block.record_batch().num_columns(), 3);

    let names: HashSet<String> = inserts[0]
        .block
        .record_batch()
        .column(0)
        .as_string::<i32>()
        .iter()
        .flatten()
        .map(str::to_string)
        .collect();
    assert_eq!(names.len(), 3);

    // Nothing else is flushed while the stream stays open
    sleep(Duration::from_secs(30)).await;
    assert_eq!(store.insert_count(), 1);
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn test_three_sources_partial_batch_flushed_after_timeout() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let partition = sink.build("clickhouse_out", 0, 1).await.unwrap();

    let worker = tokio::spawn(run_partition(
        partition,
        metrics_schema(),
        three_sources([10, 10, 10]),
        sink.batch_policy(),
    ));

    sleep(Duration::from_millis(4900)).await;
    assert_eq!(store.insert_count(), 0);

    sleep(Duration::from_millis(600)).await;
    let inserts = store.inserts();
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].block.num_rows(), 30);
    assert_eq!(inserts[0].block.record_batch().num_columns(), 3);
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn test_stream_end_drains_without_waiting_for_timeout() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let partition = sink.build("clickhouse_out", 0, 1).await.unwrap();

    let records: Vec<KeyedRecord> = (0..7)
        .map(|i| KeyedRecord::new(ALL_KEY, metric_row("cpu", i as f64, i)))
        .collect();

    let start = Instant::now();
    let stats = run_partition(
        partition,
        metrics_schema(),
        stream::iter(records),
        sink.batch_policy(),
    )
    .await
    .unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.records, 7);
    assert_eq!(store.insert_count(), 1);
    // reconcile + partition, both released
    assert_eq!(store.connections_closed(), 2);
}

#[tokio::test]
async fn test_concatenation_single_insert_in_arrival_order() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let mut partition = sink.build("clickhouse_out", 0, 1).await.unwrap();
    let schema = metrics_schema();

    let first: Vec<Row> = (0..10).map(|i| metric_row("a_metric", i as f64, i)).collect();
    let second: Vec<Row> = (0..5)
        .map(|i| metric_row("b_metric", 100.0 + i as f64, 100 + i))
        .collect();

    let written = partition
        .write_batch(vec![
            RecordBlock::from_rows(&schema, &first).unwrap(),
            RecordBlock::from_rows(&schema, &second).unwrap(),
        ])
        .await
        .unwrap();
    assert_eq!(written, 15);

    let inserts = store.inserts();
    assert_eq!(inserts.len(), 1);
    let batch = inserts[0].block.record_batch();
    assert_eq!(batch.num_rows(), 15);
    let values = batch.column(1).as_primitive::<Float64Type>();
    assert_eq!(values.value(0), 0.0);
    assert_eq!(values.value(9), 9.0);
    assert_eq!(values.value(10), 100.0);
    assert_eq!(values.value(14), 104.0);
}

#[tokio::test]
async fn test_differing_schemas_fail_without_insert() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let mut partition = sink.build("clickhouse_out", 0, 1).await.unwrap();

    let other = RecordSchema::new([
        Field::new("metric", DataType::Utf8, false),
        Field::new("value", DataType::Int64, false),
    ])
    .unwrap();

    let err = partition
        .write_batch(vec![
            RecordBlock::from_rows(&metrics_schema(), &[metric_row("a", 1.0, 1)]).unwrap(),
            RecordBlock::from_rows(&other, &[row!["a", 1_i64]]).unwrap(),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, SinkError::Schema(_)), "{err}");
    assert_eq!(store.insert_attempts(), 0);
}

#[tokio::test]
async fn test_empty_flush_issues_no_insert() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let mut partition = sink.build("clickhouse_out", 0, 1).await.unwrap();

    assert_eq!(partition.write_batch(vec![]).await.unwrap(), 0);
    let empty = RecordBlock::from_rows(&metrics_schema(), &[]).unwrap();
    assert_eq!(partition.write_batch(vec![empty]).await.unwrap(), 0);
    assert_eq!(store.insert_attempts(), 0);
}

#[tokio::test]
async fn test_redelivery_is_idempotent_after_merge() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let mut partition = sink.build("clickhouse_out", 0, 1).await.unwrap();

    let rows: Vec<Row> = (0..20)
        .map(|i| metric_row(if i % 2 == 0 { "a" } else { "b" }, i as f64, i / 2))
        .collect();
    let block = RecordBlock::from_rows(&metrics_schema(), &rows).unwrap();

    partition.write_batch(vec![block.clone()]).await.unwrap();
    let once = store.merge("analytics", "metrics").unwrap().unwrap();

    // Worker restarts and the same batch is redelivered
    partition.write_batch(vec![block.clone()]).await.unwrap();
    assert_eq!(store.row_count("analytics", "metrics"), 40);

    let twice = store.merge("analytics", "metrics").unwrap().unwrap();
    assert_eq!(twice.num_rows(), 20);
    assert_eq!(twice, once);
    assert_eq!(twice.record_batch(), block.record_batch());
}

#[tokio::test]
async fn test_conversion_error_stops_worker_and_closes_connection() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let partition = sink.build("clickhouse_out", 0, 1).await.unwrap();

    let records = vec![
        KeyedRecord::new(ALL_KEY, metric_row("cpu", 1.0, 1)),
        KeyedRecord::new(ALL_KEY, row!["cpu", "not a number", Utc::now()]),
    ];

    let err = run_partition(
        partition,
        metrics_schema(),
        stream::iter(records),
        sink.batch_policy(),
    )
    .await
    .unwrap_err();

    match err {
        SinkError::Conversion(inner) => {
            let msg = inner.to_string();
            assert!(msg.contains("row 1"), "{msg}");
            assert!(msg.contains("'value'"), "{msg}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(store.insert_attempts(), 0);
    assert_eq!(store.connections_closed(), 2);
}

#[tokio::test]
async fn test_delivery_error_is_propagated_not_retried() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let partition = sink.build("clickhouse_out", 0, 1).await.unwrap();
    store.fail_next_insert(Fault::Delivery("Code: 241. Memory limit exceeded".into()));

    let records: Vec<KeyedRecord> = (0..60)
        .map(|i| KeyedRecord::new(ALL_KEY, metric_row("cpu", i as f64, i)))
        .collect();

    let err = run_partition(
        partition,
        metrics_schema(),
        stream::iter(records),
        sink.batch_policy(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SinkError::Delivery(_)));
    assert_eq!(store.insert_attempts(), 1);
    assert_eq!(store.insert_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_output_fans_out_by_key() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    let policy = BatchPolicy::new(8, Duration::from_secs(5));

    let keys = ["a", "b", "c", "d", "e", "f"];
    let records: Vec<KeyedRecord> = (0..300)
        .map(|i| {
            let key = keys[i % keys.len()];
            KeyedRecord::new(key, metric_row(key, i as f64, i as i64))
        })
        .collect();

    let stats = pipeline::output(&sink, metrics_schema(), stream::iter(records), policy, 3)
        .await
        .unwrap();

    assert_eq!(stats.records, 300);
    let inserts = store.inserts();
    assert_eq!(inserts.len() as u64, stats.batches);
    assert_eq!(
        inserts.iter().map(|c| c.block.num_rows()).sum::<usize>(),
        300
    );

    // Every insert carries one key's batch and respects max_size
    for call in &inserts {
        assert!(call.block.num_rows() <= 8);
        let names: HashSet<&str> = call
            .block
            .record_batch()
            .column(0)
            .as_string::<i32>()
            .iter()
            .flatten()
            .collect();
        assert_eq!(names.len(), 1);
    }

    // reconcile + one connection per worker, all released
    assert_eq!(store.connections_opened(), 4);
    assert_eq!(store.connections_closed(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_output_reports_worker_failure() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    store.fail_next_insert(Fault::Connection("connection reset by peer".into()));

    let records: Vec<KeyedRecord> = (0..120)
        .map(|i| KeyedRecord::new(ALL_KEY, metric_row("cpu", i as f64, i)))
        .collect();

    let err = pipeline::output(
        &sink,
        metrics_schema(),
        stream::iter(records),
        sink.batch_policy(),
        2,
    )
    .await
    .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(store.insert_count(), 0);
}

fn key_for_worker(worker: usize, workers: usize) -> String {
    (0..)
        .map(|i| format!("k{i}"))
        .find(|key| pipeline::worker_for(key, workers) == worker)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_output_fails_fast_while_input_keeps_flowing() {
    let store = MemoryStore::new();
    let sink = metrics_sink(&store).await;
    store.fail_next_insert(Fault::Delivery(
        "Code: 53. DB::Exception: Type mismatch in column value".into(),
    ));

    let failing = key_for_worker(0, 2);
    let healthy = key_for_worker(1, 2);

    // One record for the failing worker, then an endless trickle for the other
    let first = KeyedRecord::new(failing.clone(), metric_row(&failing, 1.0, 0));
    let trickle = stream::repeat_with(move || {
        KeyedRecord::new(healthy.clone(), metric_row(&healthy, 2.0, 1))
    })
    .then(|record| async move {
        sleep(Duration::from_millis(100)).await;
        record
    });
    let records = stream::once(async move { first }).chain(trickle);

    let result = tokio::time::timeout(
        Duration::from_secs(600),
        pipeline::output(
            &sink,
            metrics_schema(),
            records,
            BatchPolicy::new(1, Duration::from_secs(5)),
            2,
        ),
    )
    .await;

    assert!(
        matches!(result, Ok(Err(SinkError::Delivery(_)))),
        "{result:?}"
    );
    // reconcile + both workers, all released
    assert_eq!(store.connections_opened(), 3);
    assert_eq!(store.connections_closed(), 3);
}
