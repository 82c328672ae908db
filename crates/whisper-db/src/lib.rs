//! # whisper-db
//!
//! Database layer for Whisper: PostgreSQL (sqlx) for everything durable,
//! optional Redis for shared counters, and an S3/MinIO presigner for
//! attachment access.

pub mod redis_pool;
pub mod repository;
pub mod storage;

use anyhow::Result;

/// Shared database state passed through the service crates.
#[derive(Clone)]
pub struct Database {
    /// PostgreSQL pool.
    pub pg: sqlx::PgPool,
    /// Redis connection (`None` when `REDIS_URL` is unset — counters stay
    /// in-process).
    pub redis: Option<redis::aio::ConnectionManager>,
}

impl Database {
    /// Connect using the URL in `config.database.url`.
    pub async fn connect(config: &whisper_common::config::AppConfig) -> Result<Self> {
        tracing::info!("Connecting to PostgreSQL…");
        let pg = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .connect(&config.database.url)
            .await?;

        let redis = match &config.redis.url {
            Some(url) => {
                tracing::info!("Connecting to Redis…");
                let client = redis::Client::open(url.as_str())?;
                let mgr = redis::aio::ConnectionManager::new(client).await?;
                tracing::info!("Connected to Redis");
                Some(mgr)
            }
            None => {
                tracing::info!("REDIS_URL not set — rate counters stay in-process");
                None
            }
        };

        Ok(Self { pg, redis })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations…");
        sqlx::migrate!("./migrations").run(&self.pg).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}
