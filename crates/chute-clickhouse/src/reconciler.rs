//! Destination table reconciliation
//!
//! Runs once per sink construction, before any partition exists:
//!
//! 1. If the table is absent, create it as a `ReplacingMergeTree` ordered by
//!    the configured key. Creation needs a declared schema and a non-empty
//!    key; without them construction fails with a configuration error.
//! 2. If the table exists, read its engine. Anything other than a
//!    `ReplacingMergeTree` variant is logged as a warning: writes still work
//!    but redelivered records will not be collapsed.
//! 3. Read the column list and log it. The columns are diagnostic only and
//!    never compared against the record schema.

use crate::client::{ColumnInfo, StoreClient};
use crate::error::{Result, SinkError};
use crate::schema::{TableDescriptor, DEDUP_ENGINE};
use tracing::{info, warn};

/// Outcome of reconciling the destination table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The table was absent and has been created
    Created { columns: Vec<ColumnInfo> },
    /// The table already existed
    Existing {
        engine: String,
        columns: Vec<ColumnInfo>,
        dedup_compatible: bool,
    },
}

impl Reconciliation {
    pub fn columns(&self) -> &[ColumnInfo] {
        match self {
            Reconciliation::Created { columns } | Reconciliation::Existing { columns, .. } => {
                columns
            }
        }
    }

    /// Whether redelivered records will be collapsed by the table engine
    pub fn is_dedup_compatible(&self) -> bool {
        match self {
            Reconciliation::Created { .. } => true,
            Reconciliation::Existing {
                dedup_compatible, ..
            } => *dedup_compatible,
        }
    }
}

/// Check whether an engine name collapses duplicates by ordering key.
///
/// Matches `ReplacingMergeTree` and its replicated/shared variants.
pub fn is_dedup_engine(engine: &str) -> bool {
    engine.contains(DEDUP_ENGINE)
}

pub struct Reconciler<'a> {
    database: &'a str,
    descriptor: &'a TableDescriptor,
}

impl<'a> Reconciler<'a> {
    pub fn new(database: &'a str, descriptor: &'a TableDescriptor) -> Self {
        Self {
            database,
            descriptor,
        }
    }

    pub async fn reconcile(&self, client: &dyn StoreClient) -> Result<Reconciliation> {
        let table = self.descriptor.name();

        if !client.table_exists(self.database, table).await? {
            self.descriptor.ensure_creatable()?;
            info!(
                database = %self.database,
                table,
                order_by = ?self.descriptor.order_by(),
                "Table not found, creating it with a {} engine", DEDUP_ENGINE
            );
            client.create_table(self.database, self.descriptor).await?;
            let columns = self.log_columns(client).await?;
            return Ok(Reconciliation::Created { columns });
        }

        let engine = client
            .table_engine(self.database, table)
            .await?
            .ok_or_else(|| {
                SinkError::schema(format!(
                    "table {}.{} disappeared during reconciliation",
                    self.database, table
                ))
            })?;

        let dedup_compatible = is_dedup_engine(&engine);
        if dedup_compatible {
            info!(database = %self.database, table, engine = %engine, "Using existing table");
        } else {
            warn!(
                database = %self.database,
                table,
                engine = %engine,
                "Table engine is not a {}; duplicate rows from redelivery will not be collapsed",
                DEDUP_ENGINE
            );
        }

        let columns = self.log_columns(client).await?;
        Ok(Reconciliation::Existing {
            engine,
            columns,
            dedup_compatible,
        })
    }

    async fn log_columns(&self, client: &dyn StoreClient) -> Result<Vec<ColumnInfo>> {
        let columns = client
            .table_columns(self.database, self.descriptor.name())
            .await?;
        for column in &columns {
            info!(column = %column.name, type_expr = %column.type_expr, "Table column");
        }
        info!(
            table = self.descriptor.name(),
            columns = columns.len(),
            "Table schema inspected"
        );
        Ok(columns)
    }
}
