//! Router gateway (EMBP pattern, kept from the teacher): merges each
//! sub-router and owns the shared application state type so individual route
//! modules stay ignorant of their siblings.

use std::sync::Arc;

use axum::Router;

use crate::config::Config;
use crate::provider::registry::ProviderRegistry;
use crate::store::CacheStore;

mod health;
mod timeseries;

/// Shared state handed to every route handler (spec §6's external interface
/// sits on top of the store + registry + config built in `main.rs`).
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CacheStore>,
    pub registry: Arc<ProviderRegistry>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(timeseries::router())
        .with_state(state)
}
