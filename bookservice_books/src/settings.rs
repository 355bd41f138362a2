use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

const SERVICE_NAME_KEY: &str = "service_name";
const POSTGRES_DATABASE_KEY: &str = "postgres_database";

/// Mode the service runs in
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Debug,
    Test,
    Release,
}

/// Service settings. Every field can be overridden by the environment variable
/// with the same name in upper case, e.g. `POSTGRES_HOST`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub service_name: String,
    pub environment: RunMode,
    pub version: String,

    pub http_host: String,
    pub http_port: u16,

    /// Keeps books in memory instead of postgres
    pub use_in_memory_db: bool,

    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_database: String,
    pub postgres_max_connections: usize,
    pub pool_wait_timeout_ms: u64,
    pub query_timeout_ms: u64,

    /// Page size used when a list request has no limit, 0 lists everything
    pub default_page_limit: i64,

    // Peer service, not called by the book service itself
    pub user_service_host: String,
    pub user_grpc_port: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "book_service".to_string(),
            environment: RunMode::Debug,
            version: "1.0".to_string(),
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            use_in_memory_db: false,
            postgres_host: "localhost".to_string(),
            postgres_port: 5432,
            postgres_user: "postgres".to_string(),
            postgres_password: "postgres".to_string(),
            postgres_database: "book_service".to_string(),
            postgres_max_connections: 30,
            pool_wait_timeout_ms: 5000,
            query_timeout_ms: 5000,
            default_page_limit: 0,
            user_service_host: "localhost".to_string(),
            user_grpc_port: ":9101".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from `.env` file (if present) and process environment
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", err);
        }
        Self::load_from(Environment::default())
    }

    /// Loads settings from the given variables instead of the process environment
    pub fn load_from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::load_from(Environment::default().source(Some(vars)))
    }

    fn load_from(environment: Environment) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let config = Config::builder()
            .set_default(SERVICE_NAME_KEY, defaults.service_name)?
            .set_default("environment", "debug")?
            .set_default("version", defaults.version)?
            .set_default("http_host", defaults.http_host)?
            .set_default("http_port", i64::from(defaults.http_port))?
            .set_default("use_in_memory_db", defaults.use_in_memory_db)?
            .set_default("postgres_host", defaults.postgres_host)?
            .set_default("postgres_port", i64::from(defaults.postgres_port))?
            .set_default("postgres_user", defaults.postgres_user)?
            .set_default("postgres_password", defaults.postgres_password)?
            .set_default("postgres_max_connections", defaults.postgres_max_connections as i64)?
            .set_default("pool_wait_timeout_ms", defaults.pool_wait_timeout_ms as i64)?
            .set_default("query_timeout_ms", defaults.query_timeout_ms as i64)?
            .set_default("default_page_limit", defaults.default_page_limit)?
            .set_default("user_service_host", defaults.user_service_host)?
            .set_default("user_grpc_port", defaults.user_grpc_port)?
            .add_source(environment)
            .build()?;

        // Database is named after the service unless set explicitly
        let service_name: String = config.get(SERVICE_NAME_KEY)?;
        Config::builder()
            .set_default(POSTGRES_DATABASE_KEY, service_name)?
            .add_source(config)
            .build()?
            .try_deserialize()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn pool_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_wait_timeout_ms)
    }
}
