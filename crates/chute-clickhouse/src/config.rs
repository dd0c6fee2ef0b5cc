//! Sink configuration
//!
//! A sink is configured once, at factory construction, from either code or a
//! YAML file:
//!
//! ```yaml
//! host: localhost
//! port: 8123
//! username: admin
//! password: ${CLICKHOUSE_PASSWORD}
//! database: analytics
//! table: metrics
//! schema: |
//!   metric String,
//!   value Float64,
//!   ts DateTime64(6)
//! order_by: "metric, ts"
//! batch:
//!   max_size: 50
//!   timeout_ms: 5000
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are expanded from the environment before
//! parsing.

use crate::error::{Result, SinkError};
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Database used when none is configured
pub const DEFAULT_DATABASE: &str = "default";

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Valid ClickHouse identifiers (database, table and column names).
static IDENTIFIER_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,254}$")
        .expect("identifier regex pattern is invalid - this is a bug")
});

/// Check that `name` is safe to place (quoted) inside generated SQL.
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if IDENTIFIER_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(SinkError::config(format!(
            "invalid {} name '{}': must match [A-Za-z_][A-Za-z0-9_]*",
            kind, name
        )))
    }
}

/// Backtick-quoted `database`.`table` for already validated identifiers.
pub fn qualified_name(database: &str, table: &str) -> String {
    format!("`{}`.`{}`", database, table)
}

/// Wire compression for ClickHouse requests.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Lz4,
}

/// ClickHouse password.
///
/// Prints as `***`, is never serialized and is read from YAML as a plain
/// string. The JSON schema marks it write-only.
#[derive(Clone)]
pub struct Password(SecretString);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Plain value, for the client builder and HTTP basic auth only.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// `default` users usually have none.
    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl Default for Password {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl JsonSchema for Password {
    fn schema_name() -> String {
        "Password".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = gen.subschema_for::<String>();
        if let schemars::schema::Schema::Object(obj) = &mut schema {
            obj.format = Some("password".to_string());
            obj.metadata().write_only = true;
        }
        schema
    }
}

/// Connection settings shared read-only by the reconciler and every partition.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ConnectionConfig {
    /// ClickHouse host
    #[serde(default = "default_host")]
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// ClickHouse HTTP port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Username; the user needs INSERT (and CREATE TABLE when the table is absent)
    #[validate(length(min = 1, max = 255))]
    pub username: String,

    /// Never written back out when the config is serialized
    #[serde(skip_serializing)]
    pub password: Password,

    /// Target database. Falls back to `default` with a warning when unset.
    #[serde(default)]
    pub database: Option<String>,

    /// Use HTTPS
    #[serde(default)]
    pub secure: bool,

    /// Compression for metadata queries
    #[serde(default)]
    pub compression: Compression,

    /// Per-request timeout for inserts, in seconds
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8123
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ConnectionConfig {
    pub fn new(username: impl Into<String>, password: impl Into<Password>) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: username.into(),
            password: password.into(),
            database: None,
            secure: false,
            compression: Compression::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// HTTP(S) endpoint of the server
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Effective database name
    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or(DEFAULT_DATABASE)
    }

    /// Backtick-quoted `database`.`table`
    pub fn qualified_table(&self, table: &str) -> String {
        qualified_name(self.database(), table)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Dual-trigger batching policy: whichever of `max_size` or `timeout` fires first.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Validate, JsonSchema, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Number of records that closes a batch
    #[serde(default = "default_max_size")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_size: usize,

    /// Milliseconds after a batch's first record at which it is closed
    #[serde(default = "default_timeout_ms")]
    #[validate(range(min = 1, max = 3_600_000))]
    pub timeout_ms: u64,
}

fn default_max_size() -> usize {
    50
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl BatchPolicy {
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            max_size,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Full sink configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct SinkConfig {
    #[serde(flatten)]
    #[validate(nested)]
    pub connection: ConnectionConfig,

    /// Target table name
    #[validate(length(min = 1, max = 255))]
    pub table: String,

    /// Column list used to create the table when it does not exist, e.g.
    /// `metric String, value Float64, ts DateTime`
    #[serde(default)]
    pub schema: Option<String>,

    /// Deduplication key for the created table, e.g. `metric, ts`
    #[serde(default)]
    pub order_by: Option<String>,

    #[serde(default)]
    #[validate(nested)]
    pub batch: BatchPolicy,
}

impl SinkConfig {
    pub fn new(
        table: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<Password>,
    ) -> Self {
        Self {
            connection: ConnectionConfig::new(username, password),
            table: table.into(),
            schema: None,
            order_by: None,
            batch: BatchPolicy::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.connection.host = host.into();
        self.connection.port = port;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.connection.database = Some(database.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn with_batch(mut self, batch: BatchPolicy) -> Self {
        self.batch = batch;
        self
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.check()?;
        Ok(config)
    }

    /// Validate field ranges and identifier safety.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| SinkError::config(e.to_string()))?;
        if let Some(database) = &self.connection.database {
            validate_identifier("database", database)?;
        }
        validate_identifier("table", &self.table)?;
        Ok(())
    }

    /// JSON schema of the YAML configuration
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(SinkConfig)
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}
