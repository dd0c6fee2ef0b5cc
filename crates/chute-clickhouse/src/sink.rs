//! Sink factory
//!
//! ```rust,ignore
//! let config = SinkConfig::new("metrics", "admin", "password")
//!     .with_database("analytics")
//!     .with_schema("metric String, value Float64, ts DateTime64(6)")
//!     .with_order_by("metric, ts");
//!
//! // Validates the config and reconciles the table, once.
//! let sink = ClickHouseSink::connect(config).await?;
//!
//! // One partition, and one connection, per worker.
//! let mut partition = sink.build("clickhouse_out", 0, 1).await?;
//! partition.write_batch(vec![block]).await?;
//! partition.close().await?;
//! ```

use crate::client::{ClickHouseConnector, StoreConnector};
use crate::config::{BatchPolicy, SinkConfig, DEFAULT_DATABASE};
use crate::error::{Result, SinkError};
use crate::partition::ClickHousePartition;
use crate::reconciler::{Reconciler, Reconciliation};
use crate::schema::{arrow_type_for, RecordSchema, TableDescriptor};
use arrow_schema::Field;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument, Span};

/// Builder for [`ClickHouseSink`]
pub struct ClickHouseSinkBuilder {
    config: SinkConfig,
    connector: Option<Arc<dyn StoreConnector>>,
    span: Option<Span>,
}

impl ClickHouseSinkBuilder {
    /// Use a custom connector (defaults to [`ClickHouseConnector`]).
    pub fn connector(mut self, connector: impl StoreConnector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn shared_connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Parent span for everything the sink and its partitions log.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Validate the configuration and reconcile the destination table.
    ///
    /// The reconciliation connection is closed before this returns.
    pub async fn build(self) -> Result<ClickHouseSink> {
        let ClickHouseSinkBuilder {
            mut config,
            connector,
            span,
        } = self;
        let span = span.unwrap_or_else(|| info_span!("clickhouse_sink", table = %config.table));

        async move {
            config.check()?;
            if config.connection.database.is_none() {
                warn!(
                    "No database configured, falling back to '{}'",
                    DEFAULT_DATABASE
                );
                config.connection.database = Some(DEFAULT_DATABASE.to_string());
            }

            let descriptor = TableDescriptor::from_config(&config)?;
            let connector =
                connector.unwrap_or_else(|| Arc::new(ClickHouseConnector) as Arc<dyn StoreConnector>);
            let database = config.connection.database().to_string();

            let client = connector.connect(&config.connection).await?;
            let reconciled = Reconciler::new(&database, &descriptor)
                .reconcile(client.as_ref())
                .await;
            let closed = client.close().await;
            let reconciliation = reconciled?;
            closed?;

            info!(
                database = %database,
                table = %config.table,
                max_size = config.batch.max_size,
                timeout_ms = config.batch.timeout_ms,
                "ClickHouse sink ready"
            );

            Ok(ClickHouseSink {
                qualified_table: config.connection.qualified_table(&config.table),
                config: Arc::new(config),
                descriptor,
                reconciliation,
                connector,
                span: Span::current(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Validated, reconciled sink that hands out one partition per worker
pub struct ClickHouseSink {
    config: Arc<SinkConfig>,
    qualified_table: String,
    descriptor: TableDescriptor,
    reconciliation: Reconciliation,
    connector: Arc<dyn StoreConnector>,
    span: Span,
}

impl ClickHouseSink {
    pub fn builder(config: SinkConfig) -> ClickHouseSinkBuilder {
        ClickHouseSinkBuilder {
            config,
            connector: None,
            span: None,
        }
    }

    /// Build with the default ClickHouse connector.
    pub async fn connect(config: SinkConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Build the partition for one worker, with its own connection.
    pub async fn build(
        &self,
        step_id: &str,
        worker_index: usize,
        worker_count: usize,
    ) -> Result<ClickHousePartition> {
        if worker_count == 0 || worker_index >= worker_count {
            return Err(SinkError::config(format!(
                "worker index {} out of range for {} workers",
                worker_index, worker_count
            )));
        }

        let span = info_span!(
            parent: &self.span,
            "partition",
            step_id,
            worker = worker_index,
            workers = worker_count
        );
        let client = self
            .connector
            .connect(&self.config.connection)
            .instrument(span.clone())
            .await?;

        Ok(ClickHousePartition::new(
            client,
            self.qualified_table.clone(),
            step_id.to_string(),
            worker_index,
            span,
        ))
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn reconciliation(&self) -> &Reconciliation {
        &self.reconciliation
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        self.config.batch
    }

    pub fn qualified_table(&self) -> &str {
        &self.qualified_table
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Record schema that rows written through this sink must follow.
    ///
    /// Derived from the declared columns when present, otherwise from the
    /// columns reported by the existing table.
    pub fn record_schema(&self) -> Result<RecordSchema> {
        if self.descriptor.has_columns() {
            return self.descriptor.record_schema();
        }
        let fields = self
            .reconciliation
            .columns()
            .iter()
            .map(|c| {
                let (data_type, nullable) = arrow_type_for(&c.type_expr)?;
                Ok(Field::new(&c.name, data_type, nullable))
            })
            .collect::<Result<Vec<_>>>()?;
        RecordSchema::new(fields)
    }
}

impl std::fmt::Debug for ClickHouseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseSink")
            .field("table", &self.qualified_table)
            .field("reconciliation", &self.reconciliation)
            .finish()
    }
}
