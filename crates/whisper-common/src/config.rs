//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call whisper_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.api_port", 8080)?
        .set_default("server.gateway_port", 8081)?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 5)?
        .set_default("auth.challenge_ttl_secs", 60)?
        .set_default("auth.session_ttl_secs", 2_592_000)? // 30 days
        .set_default("auth.admin_token", "")?
        .set_default("storage.endpoint", "")?
        .set_default("storage.bucket", "whisper")?
        .set_default("storage.access_key", "")?
        .set_default("storage.secret_key", "")?
        .set_default("storage.region", "us-east-1")?
        .set_default("storage.presign_ttl_secs", 900)? // 15 min
        .set_default("turn.urls", "")?
        .set_default("turn.shared_secret", "")?
        .set_default("turn.credential_ttl_secs", 3600)?
        .set_default("push.apns_url", "")?
        .set_default("push.apns_voip_url", "")?
        .set_default("push.fcm_url", "")?
        .set_default("push.suppress_window_secs", 30)?
        .set_default("limits.max_group_members", 50)?
        .set_default("limits.max_attachment_bytes", 104_857_600)? // 100 MiB
        .set_default("limits.attachment_ttl_days", 30)?
        .set_default("limits.bypass_rate_limits", false)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (WHISPER_SERVER__HOST, WHISPER_DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("WHISPER")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub turn: TurnConfig,
    pub push: PushConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub api_port: u16,
    pub gateway_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    /// Redis connection URL — optional; omit to keep counters in-process.
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Registration challenge TTL in seconds (challenges are one-shot).
    pub challenge_ttl_secs: u64,
    /// Session token TTL in seconds.
    pub session_ttl_secs: u64,
    /// Shared token for admin endpoints (GC trigger). Empty disables them.
    pub admin_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// S3 endpoint URL (e.g., http://localhost:9000 for MinIO).
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Presigned URL lifetime in seconds.
    pub presign_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TurnConfig {
    /// Comma-separated TURN/STUN URLs handed to clients.
    pub urls: String,
    /// Shared secret the TURN server uses to verify REST credentials.
    pub shared_secret: String,
    /// Lifetime of minted TURN credentials in seconds.
    pub credential_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PushConfig {
    /// APNs wake endpoint. Empty disables APNs sends.
    pub apns_url: String,
    /// APNs VoIP endpoint (preferred for call wakes on iOS).
    pub apns_voip_url: String,
    /// FCM wake endpoint. Empty disables FCM sends.
    pub fcm_url: String,
    /// Per-recipient-per-reason coalescing window in seconds.
    pub suppress_window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    pub max_group_members: usize,
    pub max_attachment_bytes: u64,
    pub attachment_ttl_days: i64,
    /// Disables rate-limit enforcement. Test harnesses only.
    pub bypass_rate_limits: bool,
}
