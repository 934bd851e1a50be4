//! `GET /api/timeseries` (spec §6): parses query parameters into a
//! [`crate::workflow::TimeseriesQuery`], calls
//! [`crate::workflow::run_timeseries_query`], schedules background
//! persistence of the pending frame, and serializes the response.
//!
//! Grounded on the teacher's `routes/get_readings.rs` handler shape
//! (`Query<...>`, `State<...>`, `impl IntoResponse`, a typed JSON error body
//! on 4xx) and `original_source/src/api.py`'s route list.

use axum::{extract::Query, extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::MeteoError;
use crate::workflow::{self, TimeseriesQuery};

use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/timeseries", get(handler))
}

/// Raw query-string parameters for `GET /api/timeseries`.
#[derive(Debug, Deserialize)]
pub struct TimeseriesParams {
    provider: String,
    station_id: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "comma_separated")]
    variables: Option<Vec<String>>,
    #[serde(default, deserialize_with = "comma_separated")]
    models: Option<Vec<String>>,
    timezone: Option<String>,
    #[serde(default)]
    latest: bool,
    agg: Option<String>,
    min_size: Option<usize>,
}

fn comma_separated<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(|s| s.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect()))
}

async fn handler(
    Query(params): Query<TimeseriesParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let adapter = match state.registry.get(&params.provider) {
        Ok(a) => a,
        Err(e) => return e.into_response(),
    };

    if let Some(models) = &params.models {
        if models.len() > 1 && !adapter.can_forecast() {
            return MeteoError::MultiModelUnsupported.into_response();
        }
    }

    let query = TimeseriesQuery {
        provider: params.provider.clone(),
        station_id: params.station_id.clone(),
        start_time: params.start_time,
        end_time: params.end_time,
        variables: params.variables,
        models: params.models,
        timezone: params.timezone,
    };

    let result = workflow::run_timeseries_query(
        state.store.as_ref(),
        adapter.clone(),
        &state.config.default_timezone,
        &crate::resample::default_resample_colmap(),
        query,
        params.latest,
        params.agg.as_deref(),
        params.min_size,
    )
    .await;

    match result {
        Ok((response, pending)) => {
            if !pending.is_empty() && adapter.cache_data() {
                let store = state.store.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.insert_measurements(&pending, adapter.as_ref()).await {
                        tracing::error!(error = %e, "background persistence of pending frame failed");
                    }
                });
            }
            Json(response).into_response()
        }
        Err(e) => e.into_response(),
    }
}
