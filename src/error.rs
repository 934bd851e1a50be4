//! Error taxonomy for the meteo-cache core.
//!
//! Validation errors (`InvalidRange`, `PastOnly`, `UnknownProvider`,
//! `MultiModelUnsupported`, `MixedFrequency`) surface immediately to the
//! caller. Errors during gap fetches (`Upstream`, `ProviderContract`) are
//! logged per task and swallowed by the Query Manager; they are only
//! constructed here so adapters have a common vocabulary to log with.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum MeteoError {
    #[error("invalid time range: {0}")]
    InvalidRange(String),

    #[error("start time is in the future for a non-forecast provider")]
    PastOnly,

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("unknown station '{0}' for provider '{1}'")]
    UnknownStation(String, String),

    #[error("multiple models requested but provider does not support it")]
    MultiModelUnsupported,

    #[error("mixed frequency across requested models")]
    MixedFrequency,

    #[error("invalid frequency string '{0}'")]
    BadFrequency(String),

    #[error("provider response failed contract validation: {0}")]
    ProviderContract(String),

    #[error("transient upstream failure: {0}")]
    Upstream(String),

    #[error("adapter is not open")]
    NotOpen,

    #[error("aggregation is not supported together with latest")]
    AggLatestConflict,

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

pub type MeteoResult<T> = Result<T, MeteoError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for MeteoError {
    fn into_response(self) -> Response {
        // Mapping HTTP status <- error kind is logically owned by the
        // out-of-scope HTTP layer; this impl exists so the thin routes
        // module has something to call without duplicating the mapping.
        let status = match &self {
            MeteoError::InvalidRange(_)
            | MeteoError::PastOnly
            | MeteoError::MultiModelUnsupported
            | MeteoError::MixedFrequency
            | MeteoError::BadFrequency(_)
            | MeteoError::AggLatestConflict => StatusCode::BAD_REQUEST,
            MeteoError::UnknownProvider(_) | MeteoError::UnknownStation(_, _) => {
                StatusCode::NOT_FOUND
            }
            MeteoError::Upstream(_) | MeteoError::ProviderContract(_) | MeteoError::NotOpen => {
                StatusCode::BAD_GATEWAY
            }
            MeteoError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
