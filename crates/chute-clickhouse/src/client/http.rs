use super::{ColumnInfo, StoreClient, StoreConnector};
use crate::block::RecordBlock;
use crate::config::{Compression, ConnectionConfig, Password};
use crate::error::{classify_clickhouse_error, is_auth_message, ConversionError, Result, SinkError};
use crate::schema::TableDescriptor;
use async_trait::async_trait;
use clickhouse::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, clickhouse::Row, Deserialize)]
struct ColumnRow {
    name: String,
    type_expr: String,
}

/// Connects to ClickHouse over HTTP
#[derive(Debug, Default, Clone, Copy)]
pub struct ClickHouseConnector;

#[async_trait]
impl StoreConnector for ClickHouseConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn StoreClient>> {
        Ok(Box::new(ClickHouseClient::connect(config).await?))
    }
}

/// A ClickHouse connection.
///
/// Metadata and DDL go through the `clickhouse` client; record blocks are
/// posted as a single Arrow IPC stream.
pub struct ClickHouseClient {
    client: Client,
    http: reqwest::Client,
    url: String,
    username: String,
    password: Password,
}

impl ClickHouseClient {
    /// Open a connection and check it with `SELECT 1`, so bad credentials or
    /// an unreachable server fail here rather than at the first flush.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let url = config.url();
        let mut client = Client::default()
            .with_url(&url)
            .with_user(&config.username)
            .with_database(config.database());
        if !config.password.is_empty() {
            client = client.with_password(config.password.expose());
        }
        client = match config.compression {
            Compression::Lz4 => client.with_compression(clickhouse::Compression::Lz4),
            Compression::None => client.with_compression(clickhouse::Compression::None),
        };

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SinkError::config(format!("failed to build HTTP client: {}", e)))?;

        client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map_err(|e| classify_clickhouse_error(&e))?;

        debug!(url = %url, user = %config.username, database = %config.database(), "Connected to ClickHouse");

        Ok(Self {
            client,
            http,
            url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

impl std::fmt::Debug for ClickHouseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseClient")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password)
            .finish()
    }
}

#[async_trait]
impl StoreClient for ClickHouseClient {
    async fn table_exists(&self, database: &str, table: &str) -> Result<bool> {
        let count = self
            .client
            .query("SELECT count() FROM system.tables WHERE database = ? AND name = ?")
            .bind(database)
            .bind(table)
            .fetch_one::<u64>()
            .await
            .map_err(|e| classify_clickhouse_error(&e))?;
        Ok(count > 0)
    }

    async fn create_table(&self, database: &str, descriptor: &TableDescriptor) -> Result<()> {
        let sql = descriptor.create_statement(database)?;
        debug!(sql = %sql, "Creating ClickHouse table");
        self.client
            .query(&sql)
            .execute()
            .await
            .map_err(|e| classify_clickhouse_error(&e))
    }

    async fn table_engine(&self, database: &str, table: &str) -> Result<Option<String>> {
        self.client
            .query("SELECT engine FROM system.tables WHERE database = ? AND name = ?")
            .bind(database)
            .bind(table)
            .fetch_optional::<String>()
            .await
            .map_err(|e| classify_clickhouse_error(&e))
    }

    async fn table_columns(&self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self
            .client
            .query(
                "SELECT name, type AS type_expr FROM system.columns \
                 WHERE database = ? AND table = ? ORDER BY position",
            )
            .bind(database)
            .bind(table)
            .fetch_all::<ColumnRow>()
            .await
            .map_err(|e| classify_clickhouse_error(&e))?;
        Ok(rows
            .into_iter()
            .map(|r| ColumnInfo::new(r.name, r.type_expr))
            .collect())
    }

    async fn insert_block(&self, qualified_table: &str, block: &RecordBlock) -> Result<()> {
        let body = block.to_arrow_ipc().map_err(ConversionError::from)?;
        let sql = format!("INSERT INTO {} FORMAT ArrowStream", qualified_table);
        debug!(
            table = %qualified_table,
            rows = block.num_rows(),
            bytes = body.len(),
            "Posting Arrow block to ClickHouse"
        );

        let response = self
            .http
            .post(&self.url)
            .query(&[
                ("query", sql.as_str()),
                ("async_insert", "0"),
                ("wait_end_of_query", "1"),
            ])
            .basic_auth(&self.username, Some(self.password.expose()))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable response body: {}>", e));
        Err(classify_status(status, text))
    }

    async fn close(&self) -> Result<()> {
        debug!(url = %self.url, "Closing ClickHouse connection");
        Ok(())
    }
}

fn classify_transport_error(err: reqwest::Error) -> SinkError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        SinkError::connection(err.to_string())
    } else {
        SinkError::delivery(err.to_string())
    }
}

/// Classify a failed insert response.
///
/// Anything the server answered that is neither an auth failure nor a
/// gateway error is a rejected insert, so it is a delivery error even when
/// the body names a column or a type.
fn classify_status(status: StatusCode, body: String) -> SinkError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SinkError::Auth(body),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            SinkError::connection(format!("HTTP {}: {}", status, body))
        }
        _ if is_auth_message(&body) => SinkError::Auth(body),
        _ => SinkError::delivery(format!("HTTP {}: {}", status, body)),
    }
}
