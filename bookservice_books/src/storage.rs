use std::sync::Arc;

use anyhow::Context;
use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use crate::books_repository::{BookRepository, InMemoryBookRepository, PostgresBooksRepository};
use crate::settings::Settings;

/// Entry point to the stored data, hides which database is used
pub trait Storage: Send + Sync {
    fn book(&self) -> &dyn BookRepository;

    /// Releases database connections. Repositories fail after this is called.
    fn close(&self);
}

/// Creates the postgres connection pool. Connections are opened lazily.
pub fn create_pool(settings: &Settings) -> anyhow::Result<Pool> {
    tracing::info!(
        "Postgres pool for {}@{}:{}/{} with at most {} connections",
        settings.postgres_user,
        settings.postgres_host,
        settings.postgres_port,
        settings.postgres_database,
        settings.postgres_max_connections
    );

    let mut config = deadpool_postgres::Config::new();
    config.host = Some(settings.postgres_host.clone());
    config.port = Some(settings.postgres_port);
    config.user = Some(settings.postgres_user.clone());
    config.password = Some(settings.postgres_password.clone());
    config.dbname = Some(settings.postgres_database.clone());
    config.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let mut pool_config = PoolConfig::new(settings.postgres_max_connections);
    pool_config.timeouts.wait = Some(settings.pool_wait_timeout());
    config.pool = Some(pool_config);

    config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .context("Failed to create postgres pool")
}

pub struct PostgresStorage {
    pool: Pool,
    books: PostgresBooksRepository,
}

impl PostgresStorage {
    pub async fn init(settings: &Settings) -> anyhow::Result<Self> {
        let pool = create_pool(settings)?;
        let books = PostgresBooksRepository::new(
            pool.clone(),
            settings.query_timeout(),
            settings.default_page_limit,
        );
        books.create_schema().await?;
        Ok(Self { pool, books })
    }
}

impl Storage for PostgresStorage {
    fn book(&self) -> &dyn BookRepository {
        &self.books
    }

    fn close(&self) {
        tracing::info!("Closing postgres pool");
        self.pool.close();
    }
}

#[derive(Default)]
pub struct InMemoryStorage {
    books: InMemoryBookRepository,
}

impl InMemoryStorage {
    pub fn new(default_page_limit: i64) -> Self {
        Self {
            books: InMemoryBookRepository::new(default_page_limit),
        }
    }
}

impl Storage for InMemoryStorage {
    fn book(&self) -> &dyn BookRepository {
        &self.books
    }

    fn close(&self) {}
}

/// Builds the storage selected by the settings
pub async fn init_storage(settings: &Settings) -> anyhow::Result<Arc<dyn Storage>> {
    Ok(if settings.use_in_memory_db {
        tracing::info!("Using in memory book storage");
        Arc::new(InMemoryStorage::new(settings.default_page_limit))
    } else {
        Arc::new(PostgresStorage::init(settings).await?)
    })
}
