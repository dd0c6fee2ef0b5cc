//! Sink construction and table reconciliation against the in-memory store
//!
//! Run with: cargo test -p chute-clickhouse --test reconcile_test

use chute_clickhouse::datagen::{METRICS_DDL, METRICS_ORDER_BY};
use chute_clickhouse::testing::{Fault, MemoryStore};
use chute_clickhouse::{ClickHouseSink, ColumnInfo, Reconciliation, SinkConfig, SinkError};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).to_string()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

fn metrics_config() -> SinkConfig {
    SinkConfig::new("metrics", "admin", "password")
        .with_database("analytics")
        .with_schema(METRICS_DDL)
        .with_order_by(METRICS_ORDER_BY)
}

#[tokio::test]
async fn test_absent_table_is_created() {
    let store = MemoryStore::new();
    let sink = ClickHouseSink::builder(metrics_config())
        .connector(store.connector())
        .build()
        .await
        .unwrap();

    assert!(matches!(sink.reconciliation(), Reconciliation::Created { .. }));
    assert!(store.table_exists("analytics", "metrics"));
    assert_eq!(
        store.engine("analytics", "metrics").as_deref(),
        Some("ReplacingMergeTree")
    );
    assert_eq!(
        store.columns("analytics", "metrics"),
        vec![
            ColumnInfo::new("metric", "String"),
            ColumnInfo::new("value", "Float64"),
            ColumnInfo::new("ts", "DateTime64(6)"),
        ]
    );

    let ddl = store.ddl();
    assert_eq!(ddl.len(), 1);
    assert!(ddl[0].starts_with("CREATE TABLE IF NOT EXISTS `analytics`.`metrics`"));
    assert!(ddl[0].ends_with("ENGINE = ReplacingMergeTree() ORDER BY tuple(`metric`, `ts`)"));

    // The reconciliation connection is released before build returns
    assert_eq!(store.connections_opened(), 1);
    assert_eq!(store.connections_closed(), 1);
    assert_eq!(store.insert_attempts(), 0);
}

#[tokio::test]
async fn test_absent_table_without_schema_fails() {
    let store = MemoryStore::new();
    let config = SinkConfig::new("metrics", "admin", "password").with_database("analytics");

    let err = ClickHouseSink::builder(config)
        .connector(store.connector())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, SinkError::Config(ref m) if m.contains("missing schema")), "{err}");
    assert!(!store.table_exists("analytics", "metrics"));
    assert!(store.ddl().is_empty());
    assert_eq!(store.connections_closed(), 1);
}

#[tokio::test]
async fn test_absent_table_without_order_by_fails() {
    let store = MemoryStore::new();
    let config = SinkConfig::new("metrics", "admin", "password")
        .with_database("analytics")
        .with_schema(METRICS_DDL);

    let err = ClickHouseSink::builder(config)
        .connector(store.connector())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, SinkError::Config(ref m) if m.contains("order_by")));
    assert!(!store.table_exists("analytics", "metrics"));
}

#[tokio::test]
async fn test_existing_non_replacing_table_warns() {
    let (logs, _guard) = capture_logs();
    let store = MemoryStore::new().with_table(
        "analytics",
        "metrics",
        "MergeTree",
        &[("metric", "String"), ("value", "Float64"), ("ts", "DateTime")],
        &["metric", "ts"],
    );

    let sink = ClickHouseSink::builder(metrics_config())
        .connector(store.connector())
        .build()
        .await
        .unwrap();

    match sink.reconciliation() {
        Reconciliation::Existing {
            engine,
            dedup_compatible,
            columns,
        } => {
            assert_eq!(engine, "MergeTree");
            assert!(!dedup_compatible);
            assert_eq!(columns.len(), 3);
        }
        other => panic!("unexpected reconciliation {other:?}"),
    }
    assert!(store.ddl().is_empty());

    let output = logs.contents();
    assert!(output.contains("WARN"), "{output}");
    assert!(output.contains("not a ReplacingMergeTree"), "{output}");
}

#[tokio::test]
async fn test_existing_replacing_table_is_silent() {
    let (logs, _guard) = capture_logs();
    let store = MemoryStore::new().with_table(
        "analytics",
        "metrics",
        "ReplacingMergeTree",
        &[("metric", "String"), ("value", "Float64"), ("ts", "DateTime")],
        &["metric", "ts"],
    );

    let sink = ClickHouseSink::builder(metrics_config())
        .connector(store.connector())
        .build()
        .await
        .unwrap();

    assert!(sink.reconciliation().is_dedup_compatible());
    assert!(store.ddl().is_empty());
    assert!(!logs.contents().contains("WARN"), "{}", logs.contents());
}

#[tokio::test]
async fn test_table_columns_logged_at_info() {
    let (logs, _guard) = capture_logs();
    let store = MemoryStore::new().with_table(
        "analytics",
        "metrics",
        "ReplacingMergeTree",
        &[("metric", "String"), ("value", "Float64"), ("ts", "DateTime64(6)")],
        &["metric", "ts"],
    );

    ClickHouseSink::builder(metrics_config())
        .connector(store.connector())
        .build()
        .await
        .unwrap();

    let out = logs.contents();
    let column_lines: Vec<&str> = out
        .lines()
        .filter(|l| l.contains("Table column"))
        .collect();
    assert_eq!(column_lines.len(), 3, "{out}");
    assert!(column_lines.iter().all(|l| l.contains("INFO")), "{out}");
    assert!(column_lines[0].contains("column=metric"), "{out}");
    assert!(column_lines[2].contains("type_expr=DateTime64(6)"), "{out}");
    assert!(out.contains("Table schema inspected"), "{out}");
}

#[tokio::test]
async fn test_existing_table_provides_record_schema() {
    let store = MemoryStore::new().with_table(
        "analytics",
        "events",
        "ReplacingMergeTree",
        &[("id", "UInt64"), ("name", "Nullable(String)")],
        &["id"],
    );
    let config = SinkConfig::new("events", "admin", "password").with_database("analytics");

    let sink = ClickHouseSink::builder(config)
        .connector(store.connector())
        .build()
        .await
        .unwrap();

    let schema = sink.record_schema().unwrap();
    assert_eq!(schema.field_names(), vec!["id", "name"]);
    assert!(schema.arrow_schema().field(1).is_nullable());
}

#[tokio::test]
async fn test_missing_database_falls_back_with_warning() {
    let (logs, _guard) = capture_logs();
    let store = MemoryStore::new();
    let config = SinkConfig::new("metrics", "admin", "password")
        .with_schema(METRICS_DDL)
        .with_order_by(METRICS_ORDER_BY);

    let sink = ClickHouseSink::builder(config)
        .connector(store.connector())
        .build()
        .await
        .unwrap();

    assert_eq!(sink.qualified_table(), "`default`.`metrics`");
    assert!(store.table_exists("default", "metrics"));
    assert!(logs.contents().contains("No database configured"));
}

#[tokio::test]
async fn test_connect_failure_is_fatal() {
    let store = MemoryStore::new();
    store.fail_next_connect(Fault::Auth("Authentication failed: password is incorrect".into()));

    let err = ClickHouseSink::builder(metrics_config())
        .connector(store.connector())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, SinkError::Auth(_)));
    assert!(!err.is_retryable());
    assert!(!store.table_exists("analytics", "metrics"));
}

#[tokio::test]
async fn test_injection_shaped_config_rejected_before_connecting() {
    let store = MemoryStore::new();

    let cases = [
        SinkConfig::new("metrics` (x String) ENGINE = Log; --", "admin", "pw")
            .with_schema(METRICS_DDL)
            .with_order_by(METRICS_ORDER_BY),
        metrics_config().with_database("analytics; DROP DATABASE system"),
        metrics_config().with_schema("metric String) ENGINE = Log; DROP TABLE users; --"),
        metrics_config().with_schema("metric String, `value` Float64 DEFAULT 1; --"),
        metrics_config().with_order_by("metric, ts) SETTINGS index_granularity = 1 --"),
    ];

    for config in cases {
        let err = ClickHouseSink::builder(config)
            .connector(store.connector())
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Config(_)), "{err}");
    }

    assert_eq!(store.connections_opened(), 0);
    assert!(store.ddl().is_empty());
}

#[tokio::test]
async fn test_partitions_get_their_own_connection() {
    let store = MemoryStore::new();
    let sink = ClickHouseSink::builder(metrics_config())
        .connector(store.connector())
        .build()
        .await
        .unwrap();

    let p0 = sink.build("out", 0, 2).await.unwrap();
    let p1 = sink.build("out", 1, 2).await.unwrap();
    assert_eq!(store.connections_opened(), 3);
    assert_eq!(p0.worker_index(), 0);
    assert_eq!(p1.qualified_table(), "`analytics`.`metrics`");

    assert!(matches!(
        sink.build("out", 2, 2).await,
        Err(SinkError::Config(_))
    ));

    p0.close().await.unwrap();
    p1.close().await.unwrap();
    assert_eq!(store.connections_closed(), 3);
}
