//! Service configuration.
//!
//! Everything comes from environment variables with production defaults, so
//! a bare `notify-relay` starts against localhost settings and a container
//! deployment overrides what it needs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::provider::ProviderSettings;
use crate::types::TenantId;

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds.
    pub listen_addr: SocketAddr,

    /// Provider connection settings.
    pub provider: ProviderSettings,

    /// Accepted API keys mapped to their tenants.
    pub api_keys: HashMap<String, TenantId>,

    /// Per-recipient admission limit (messages per trailing hour).
    pub recipient_limit_per_hour: u32,

    /// Worker pool concurrency and queue receive batch bound.
    pub worker_concurrency: usize,

    /// Queue visibility timeout requested by the worker pool.
    pub visibility_timeout: Duration,

    /// Interval between retry sweeps.
    pub retry_sweep_interval: Duration,

    /// Interval between scheduled-delivery sweeps.
    pub scheduled_sweep_interval: Duration,

    /// Base delay for the retry backoff (1 s test profile, 60 s production).
    pub retry_base_delay: Duration,

    /// Attempt cap applied to new notifications.
    pub max_attempts: u32,

    /// Token echoed back during webhook subscription verification.
    pub webhook_verify_token: String,

    /// Optional app secret for HMAC verification of callback bodies.
    pub webhook_app_secret: Option<Vec<u8>>,

    /// How long the worker pool waits for in-flight items on shutdown.
    pub shutdown_grace: Duration,

    /// Retention horizon for rate-limit windows.
    pub rate_limit_retention_days: i64,
}

impl Config {
    /// Loads configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let listen_addr = std::env::var("LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let provider = ProviderSettings {
            base_url: env_or("PROVIDER_BASE_URL", "https://graph.facebook.com"),
            api_version: env_or("PROVIDER_API_VERSION", "v18.0"),
            phone_number_id: env_or("PROVIDER_PHONE_NUMBER_ID", ""),
            access_token: env_or("PROVIDER_ACCESS_TOKEN", ""),
            timeout: Duration::from_millis(env_parse("PROVIDER_TIMEOUT_MS", 30_000)),
        };

        let api_keys = parse_api_keys(&env_or("API_KEYS", ""));
        if api_keys.is_empty() {
            tracing::warn!("API_KEYS not set, every request will be rejected with 401");
        }

        let webhook_verify_token = env_or("WEBHOOK_VERIFY_TOKEN", "");
        if webhook_verify_token.is_empty() {
            tracing::warn!("WEBHOOK_VERIFY_TOKEN not set, webhook verification will fail");
        }

        Config {
            listen_addr,
            provider,
            api_keys,
            recipient_limit_per_hour: env_parse("RATE_LIMIT_RECIPIENT_PER_HOUR", 10),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 10),
            visibility_timeout: Duration::from_secs(env_parse("WORKER_VISIBILITY_TIMEOUT_S", 30)),
            retry_sweep_interval: Duration::from_millis(env_parse("RETRY_SWEEP_INTERVAL_MS", 60_000)),
            scheduled_sweep_interval: Duration::from_millis(env_parse(
                "SCHEDULED_SWEEP_INTERVAL_MS",
                30_000,
            )),
            retry_base_delay: Duration::from_millis(env_parse("RETRY_BASE_DELAY_MS", 60_000)),
            max_attempts: env_parse("MAX_ATTEMPTS", 5),
            webhook_verify_token,
            webhook_app_secret: std::env::var("WEBHOOK_APP_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .map(String::into_bytes),
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_S", 30)),
            rate_limit_retention_days: env_parse("RATE_LIMIT_RETENTION_DAYS", 7),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parses the `API_KEYS` list.
///
/// Entries are comma-separated, either `key:tenant` pairs or bare keys.
/// A bare key maps to a tenant named after the key's first 8 characters,
/// which is enough for single-tenant installs.
pub fn parse_api_keys(raw: &str) -> HashMap<String, TenantId> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((key, tenant)) => (key.to_string(), TenantId::new(tenant)),
            None => {
                let prefix: String = entry.chars().take(8).collect();
                (entry.to_string(), TenantId::new(format!("tenant-{prefix}")))
            }
        })
        .collect()
}
