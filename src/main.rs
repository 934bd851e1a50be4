//! Application entry point for `meteo-cache`.
//!
//! Orchestrates startup: load configuration, initialize structured logging,
//! open the Postgres pool, apply the cache schema, build the provider
//! registry from `Config.providers`, and mount the HTTP surface.

use std::env;
use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Result;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use meteo_cache::config;
use meteo_cache::provider::forecast::OpenMeteoAdapter;
use meteo_cache::provider::observational::ProvinceAdapter;
use meteo_cache::provider::registry::ProviderRegistry;
use meteo_cache::routes::{self, AppState};
use meteo_cache::store::{self, PostgresStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", cfg.db_url);

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database '{}': {}", cfg.db_url, e))?;

    tracing::info!("Successfully connected to database");

    store::schema::create_schema(&pool).await?;

    let mut builder = ProviderRegistry::builder();
    for (name, provider_cfg) in &cfg.providers {
        let rate_limit = provider_cfg.rate_limit();
        match name.as_str() {
            "province" => {
                let tz: chrono_tz::Tz = provider_cfg
                    .timezone
                    .as_deref()
                    .unwrap_or("Europe/Rome")
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid timezone for provider '{name}'"))?;
                builder = builder.register(Arc::new(ProvinceAdapter::new(
                    provider_cfg.base_url.clone(),
                    tz,
                    rate_limit,
                )));
            }
            "open-meteo" | "open_meteo" => {
                builder = builder.register(Arc::new(OpenMeteoAdapter::new(
                    provider_cfg.base_url.clone(),
                    rate_limit,
                )));
            }
            other => {
                tracing::warn!(provider = other, "unrecognized provider name in PROVIDERS, skipping");
            }
        }
    }
    let registry = Arc::new(builder.build());

    let cache_store = PostgresStore::new(pool);

    let state = AppState {
        store: cache_store,
        registry,
        config: Arc::new(cfg.clone()),
    };

    let app = routes::router(state);

    tracing::info!("Listening on {}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Initialize the global tracing subscriber for structured logging.
fn init_tracing() {
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
