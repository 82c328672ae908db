//! # Whisper Server
//!
//! Main binary that wires the broker together:
//! - REST API (key lookup, backups, attachment presigning, admin GC)
//! - WebSocket gateway (registration, routing, groups, calls)
//!
//! Both surfaces share one PostgreSQL pool, one optional Redis connection,
//! and one S3 presigner; references flow in through construction.

use std::net::SocketAddr;
use std::sync::Arc;

use whisper_api::{build_router, AppState};
use whisper_db::{
    storage::{StorageClient, StorageConfig},
    Database,
};
use whisper_gateway::{rate_limit::RateLimiter, GatewayState};
use whisper_push::PushCoordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = whisper_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Whisper v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("The server never sees plaintext.");

    // Connect to stores and run migrations
    let db = Database::connect(config).await?;
    db.migrate().await?;

    // Object storage (MinIO / S3) — presigning only, never streaming
    let storage = StorageClient::new(&StorageConfig {
        endpoint: config.storage.endpoint.clone(),
        access_key: config.storage.access_key.clone(),
        secret_key: config.storage.secret_key.clone(),
        bucket: config.storage.bucket.clone(),
        region: config.storage.region.clone(),
        presign_ttl_secs: config.storage.presign_ttl_secs,
    })?;
    storage.ensure_bucket().await?;
    tracing::info!(bucket = %config.storage.bucket, "Object storage ready");

    // Push coordination and rate limiting
    let push = PushCoordinator::new(db.clone(), &config.push);
    let limiter = RateLimiter::new(Some(db.clone()), config.limits.bypass_rate_limits);
    if config.limits.bypass_rate_limits {
        tracing::warn!("Rate limiting is BYPASSED — test configuration only");
    }

    // REST API
    let api_router = build_router(AppState { db: db.clone(), storage });
    let api_addr = SocketAddr::new(config.server.host.parse()?, config.server.api_port);

    // WebSocket gateway
    let gateway_state = Arc::new(GatewayState::new(db, push, limiter));
    let gateway_router = whisper_gateway::build_router(gateway_state);
    let gateway_addr = SocketAddr::new(config.server.host.parse()?, config.server.gateway_port);

    tracing::info!("REST API listening on http://{api_addr}");
    tracing::info!("Gateway listening on ws://{gateway_addr}/ws");

    tokio::try_join!(
        async {
            let listener = tokio::net::TcpListener::bind(api_addr).await?;
            axum::serve(listener, api_router).await?;
            Ok::<_, anyhow::Error>(())
        },
        async {
            let listener = tokio::net::TcpListener::bind(gateway_addr).await?;
            // ConnectInfo feeds the pre-auth rate-limit key (client address).
            axum::serve(
                listener,
                gateway_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;
            Ok::<_, anyhow::Error>(())
        },
    )?;

    Ok(())
}
