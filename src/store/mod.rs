//! Cache Store (spec §4.1): durable idempotent storage over three logical
//! relations -- stations, variables, measurements -- with range queries
//! tuned for "all rows for (provider, station) within an instant range".
//!
//! Grounded on `original_source/src/database/db.py::MeteoDB` (SQLAlchemy
//! session-per-call, `query_station`/`query_variable`/`insert_station`/
//! `insert_data` shape) and `original_source/webhandler/database/models.py`
//! (table/column names, the `(station_id, variable_id, datetime)` unique
//! constraint -- extended here with `model` per spec §6).

pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MeteoResult;
use crate::provider::ProviderAdapter;
use crate::record::{Frame, StationInfo};

pub use postgres::PostgresStore;

/// A single registered station, identified externally by `(provider,
/// external_id)` (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Station {
    pub id: i64,
    pub provider: String,
    pub external_id: String,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub elevation: Option<f64>,
    #[sqlx(json)]
    pub metadata_json: serde_json::Value,
}

/// A single registered variable, identified externally by `name` (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Variable {
    pub id: i64,
    pub name: String,
    pub unit: Option<String>,
    pub description: Option<String>,
}

/// Durable storage contract for the three cache relations (spec §4.1).
/// Implemented by [`PostgresStore`]; a trait so the Query Manager and
/// Workflow can be tested against an in-memory fake without a real
/// database (see `tests/query_manager_tests.rs`).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Distinct providers among known stations.
    async fn list_providers(&self) -> MeteoResult<Vec<String>>;

    async fn find_station(&self, provider: &str, external_id: &str) -> MeteoResult<Option<Station>>;

    async fn list_stations(&self, provider: Option<&str>) -> MeteoResult<Vec<Station>>;

    /// Return the existing station, else fetch metadata via the adapter
    /// (best-effort -- failure yields a station with only identity fields)
    /// and insert. Concurrency-safe: concurrent callers for the same key
    /// observe a single row.
    async fn ensure_station(
        &self,
        adapter: &dyn ProviderAdapter,
        external_id: &str,
        extra_attrs: StationInfo,
    ) -> MeteoResult<Station>;

    /// Return the existing variable, else insert a new one. Concurrency-safe
    /// analogous to `ensure_station`.
    async fn ensure_variable(&self, name: &str) -> MeteoResult<Variable>;

    /// Range predicate closed on both ends. Returns the canonical pivoted
    /// frame (spec §3); timestamps are UTC-aware.
    async fn query_measurements(
        &self,
        provider: &str,
        external_id: &str,
        start_utc: DateTime<Utc>,
        end_utc: DateTime<Utc>,
        variables: Option<&[String]>,
        models: Option<&[String]>,
    ) -> MeteoResult<Frame>;

    /// Convert `frame` (wide) to long form, resolve station/variable
    /// references, normalize to UTC, and bulk upsert. Idempotent: the newer
    /// value wins on conflict. Rows whose station or variable cannot be
    /// resolved are dropped with a warning; the remainder still commits.
    async fn insert_measurements(&self, frame: &Frame, adapter: &dyn ProviderAdapter) -> MeteoResult<()>;
}
