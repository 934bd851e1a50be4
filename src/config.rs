//! Configuration loader for the `meteo-cache` service.
//!
//! Centralizes all runtime configuration values and their defaults, loading
//! from environment variables (with optional `.env` file support provided by
//! the caller), mirroring the teacher's `parse_env_u32!`/`require_env!`
//! pattern.
//!
//! Grounded on `original_source/src/runtime.py::RuntimeContext.initialize_runtime`
//! for *what* gets configured (`default_timezone`, per-provider settings,
//! resampling defaults) -- the YAML file + `config['providers']` dict become
//! environment variables here, since the teacher's config layer (and this
//! spec's Non-goals) rule out a generic config-file loader.

use std::collections::HashMap;
use std::env;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name).map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

fn optional_env(var_name: &str) -> Option<String> {
    env::var(var_name).ok()
}

/// Per-provider settings (spec §3's Provider Descriptor, **[ADDED]** concrete
/// loading shape). One of these is built per entry in `PROVIDERS`.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    /// IANA timezone name for providers whose wire format needs local-time
    /// disambiguation (e.g. `province`'s `Europe/Rome`). Unused by
    /// providers that are already UTC-native.
    pub timezone: Option<String>,
    pub max_concurrent_requests: u32,
    pub inter_request_delay_ms: u64,
    pub timeout_secs: u64,
    /// Days per chunk for providers that page long ranges (`province.py`'s
    /// `chunk_size_days`).
    pub chunk_size_days: u32,
}

impl ProviderConfig {
    pub fn rate_limit(&self) -> crate::provider::RateLimit {
        crate::provider::RateLimit {
            max_concurrent_requests: self.max_concurrent_requests as usize,
            inter_request_delay: StdDuration::from_millis(self.inter_request_delay_ms),
            timeout: StdDuration::from_secs(self.timeout_secs),
        }
    }
}

/// Strongly typed application configuration. Immutable after loading.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Fallback timezone used when a query gives neither an explicit
    /// `timezone` nor a zoned bound (`runtime.py`'s `default_timezone`).
    pub default_timezone: String,

    /// Minimum non-null sample count a resample bucket needs before it is
    /// populated rather than suppressed (`runtime.py`'s
    /// `resample_min_sample_size`).
    pub resample_min_sample_size: usize,

    /// One entry per registered provider, keyed by provider name.
    pub providers: HashMap<String, ProviderConfig>,

    pub bind_addr: std::net::SocketAddr,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` -- PostgreSQL connection string
/// - `PROVIDERS` -- comma-separated list of provider names to configure, each
///   of which needs a `<NAME>_BASE_URL` (e.g. `PROVINCE_BASE_URL`)
///
/// Optional (per provider `<NAME>`, uppercased):
/// - `<NAME>_TIMEZONE`, `<NAME>_MAX_CONCURRENT` (default 5),
///   `<NAME>_DELAY_MS` (default 1000), `<NAME>_TIMEOUT_SECS` (default 20),
///   `<NAME>_CHUNK_DAYS` (default 365)
///
/// Optional (global):
/// - `DB_POOL_MAX` (default 5), `DEFAULT_TIMEZONE` (default `Europe/Rome`),
///   `RESAMPLE_MIN_SAMPLE_SIZE` (default 1), `BIND_ADDR` (default
///   `0.0.0.0:8080`)
pub fn load_from_env() -> Result<Config> {
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let default_timezone =
        env::var("DEFAULT_TIMEZONE").unwrap_or_else(|_| "Europe/Rome".to_string());
    let resample_min_sample_size = parse_env_u32!("RESAMPLE_MIN_SAMPLE_SIZE", 1) as usize;

    let bind_addr: std::net::SocketAddr = env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .map_err(|e| anyhow!("Invalid BIND_ADDR: {}", e))?;

    let provider_names = require_env!("PROVIDERS");
    let mut providers = HashMap::new();
    for raw_name in provider_names.split(',') {
        let name = raw_name.trim();
        if name.is_empty() {
            continue;
        }
        let prefix = name.to_uppercase().replace('-', "_");
        let base_url = require_env!(&format!("{prefix}_BASE_URL"));
        let timezone = optional_env(&format!("{prefix}_TIMEZONE"));
        let max_concurrent_requests = parse_env_u32!(&format!("{prefix}_MAX_CONCURRENT"), 5);
        let inter_request_delay_ms =
            parse_env_u32!(&format!("{prefix}_DELAY_MS"), 1000) as u64;
        let timeout_secs = parse_env_u32!(&format!("{prefix}_TIMEOUT_SECS"), 20) as u64;
        let chunk_size_days = parse_env_u32!(&format!("{prefix}_CHUNK_DAYS"), 365);

        providers.insert(
            name.to_lowercase(),
            ProviderConfig {
                base_url,
                timezone,
                max_concurrent_requests,
                inter_request_delay_ms,
                timeout_secs,
                chunk_size_days,
            },
        );
    }

    Ok(Config {
        db_url,
        db_pool_max,
        default_timezone,
        resample_min_sample_size,
        providers,
        bind_addr,
    })
}

impl Config {
    /// Log the loaded configuration, masking the database password.
    pub fn log_config(&self) {
        let masked_db_url = if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                format!("{}:****{}", &self.db_url[..colon_pos], &self.db_url[at_pos..])
            } else {
                self.db_url.clone()
            }
        } else {
            self.db_url.clone()
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL             : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX              : {}", self.db_pool_max);
        tracing::info!("  DEFAULT_TIMEZONE         : {}", self.default_timezone);
        tracing::info!("  RESAMPLE_MIN_SAMPLE_SIZE : {}", self.resample_min_sample_size);
        tracing::info!("  BIND_ADDR                : {}", self.bind_addr);
        for (name, provider) in &self.providers {
            tracing::info!(
                "  provider[{}]: base_url={} timezone={:?} max_concurrent={} delay_ms={} timeout_secs={}",
                name,
                provider.base_url,
                provider.timezone,
                provider.max_concurrent_requests,
                provider.inter_request_delay_ms,
                provider.timeout_secs,
            );
        }
    }
}
