//! `sqlx::PgPool`-backed [`CacheStore`] implementation.
//!
//! Grounded on `original_source/src/database/db.py::MeteoDB`: `query_station`
//! / `query_variable` become `find_station`/`ensure_variable`, `insert_data`'s
//! melt-to-long-form + `station_id_map`/`variable_id_map` caching becomes
//! `insert_measurements`'s per-record loop against the in-process id caches
//! below, and `query_data`'s join + `pivot` becomes `query_measurements`'s
//! `QueryBuilder` join (teacher's dynamic-filter pattern from
//! `routes/get_readings.rs::load_filtered_readings`) followed by
//! [`Frame`]-building in Rust rather than pandas.
//!
//! The Python version's `insert_station`/`insert_variable` do a
//! check-then-insert with no lock, which races under concurrent callers.
//! Here both caches are held behind a `tokio::sync::Mutex` for the whole
//! check-or-create, making concurrent `ensure_*` calls for the same key
//! collapse onto a single insert (spec §4.1/§5) -- a deliberate improvement
//! over the source, recorded in DESIGN.md.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder, Row};
use tokio::sync::Mutex;

use crate::error::MeteoResult;
use crate::provider::ProviderAdapter;
use crate::record::{Frame, Record, StationInfo};

use super::{CacheStore, Station, Variable};

pub struct PostgresStore {
    pool: PgPool,
    station_ids: Mutex<HashMap<(String, String), i64>>,
    variable_ids: Mutex<HashMap<String, i64>>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(PostgresStore {
            pool,
            station_ids: Mutex::new(HashMap::new()),
            variable_ids: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CacheStore for PostgresStore {
    async fn list_providers(&self) -> MeteoResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT provider FROM stations ORDER BY provider")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    async fn find_station(&self, provider: &str, external_id: &str) -> MeteoResult<Option<Station>> {
        let station: Option<Station> = sqlx::query_as(
            "SELECT id, provider, external_id, name, latitude, longitude, elevation, metadata_json
             FROM stations WHERE provider = $1 AND external_id = $2",
        )
        .bind(provider)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(station)
    }

    async fn list_stations(&self, provider: Option<&str>) -> MeteoResult<Vec<Station>> {
        let stations: Vec<Station> = match provider {
            Some(p) => {
                sqlx::query_as(
                    "SELECT id, provider, external_id, name, latitude, longitude, elevation, metadata_json
                     FROM stations WHERE provider = $1 ORDER BY external_id",
                )
                .bind(p)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, provider, external_id, name, latitude, longitude, elevation, metadata_json
                     FROM stations ORDER BY provider, external_id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(stations)
    }

    async fn ensure_station(
        &self,
        adapter: &dyn ProviderAdapter,
        external_id: &str,
        extra_attrs: StationInfo,
    ) -> MeteoResult<Station> {
        let provider = adapter.name().to_string();
        let key = (provider.clone(), external_id.to_string());

        let mut cache = self.station_ids.lock().await;
        if cache.contains_key(&key) {
            // Cached: another call already resolved this station. Drop the
            // lock before the row read so it doesn't serialize on I/O too.
            drop(cache);
            return Ok(self
                .find_station(&provider, external_id)
                .await?
                .expect("cached station id implies the row exists; core never deletes stations"));
        }

        // Not cached: hold the lock across the check-then-insert so
        // concurrent callers for the same key collapse onto one insert
        // (spec §4.1 "concurrency-safe" / §5 double-checked pattern).
        if let Some(station) = self.find_station(&provider, external_id).await? {
            cache.insert(key, station.id);
            return Ok(station);
        }

        // Best-effort metadata fetch; failure yields identity-only fields
        // (spec §4.1: "failure yields a Station with only identity fields").
        let info = match adapter.get_station_info(external_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(provider = %provider, external_id, error = %e, "station metadata fetch failed, inserting identity-only");
                StationInfo::default()
            }
        };

        let name = extra_attrs.name.or(info.name);
        let latitude = extra_attrs.latitude.or(info.latitude);
        let longitude = extra_attrs.longitude.or(info.longitude);
        let elevation = extra_attrs.elevation.or(info.elevation);
        let metadata = serde_json::to_value(&info.extra).unwrap_or(serde_json::json!({}));

        let station: Station = sqlx::query_as(
            "INSERT INTO stations (provider, external_id, name, latitude, longitude, elevation, metadata_json)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (provider, external_id) DO UPDATE SET provider = EXCLUDED.provider
             RETURNING id, provider, external_id, name, latitude, longitude, elevation, metadata_json",
        )
        .bind(&provider)
        .bind(external_id)
        .bind(&name)
        .bind(latitude)
        .bind(longitude)
        .bind(elevation)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await?;

        cache.insert(key, station.id);
        Ok(station)
    }

    async fn ensure_variable(&self, name: &str) -> MeteoResult<Variable> {
        let mut cache = self.variable_ids.lock().await;
        if let Some(&id) = cache.get(name) {
            drop(cache);
            let variable: Variable = sqlx::query_as(
                "SELECT id, name, unit, description FROM variables WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
            return Ok(variable);
        }

        let variable: Variable = sqlx::query_as(
            "INSERT INTO variables (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, name, unit, description",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        cache.insert(name.to_string(), variable.id);
        Ok(variable)
    }

    async fn query_measurements(
        &self,
        provider: &str,
        external_id: &str,
        start_utc: DateTime<Utc>,
        end_utc: DateTime<Utc>,
        variables: Option<&[String]>,
        models: Option<&[String]>,
    ) -> MeteoResult<Frame> {
        let mut query = QueryBuilder::new(
            "SELECT m.datetime AS datetime, m.model AS model, m.value AS value, v.name AS variable
             FROM measurements m
             JOIN stations s ON m.station_id = s.id
             JOIN variables v ON m.variable_id = v.id
             WHERE s.provider = ",
        );
        query.push_bind(provider);
        query.push(" AND s.external_id = ");
        query.push_bind(external_id);
        query.push(" AND m.datetime BETWEEN ");
        query.push_bind(start_utc);
        query.push(" AND ");
        query.push_bind(end_utc);

        if let Some(vars) = variables {
            if !vars.is_empty() {
                query.push(" AND v.name = ANY(");
                query.push_bind(vars.to_vec());
                query.push(")");
            }
        }
        if let Some(models) = models {
            if !models.is_empty() {
                query.push(" AND m.model = ANY(");
                query.push_bind(models.to_vec());
                query.push(")");
            }
        }

        let rows = query.build().fetch_all(&self.pool).await?;

        // Pivot long rows (datetime, model, variable, value) into one Record
        // per (datetime, model), mirroring query_data's df.pivot step.
        let mut records: HashMap<(DateTime<Utc>, String), Record> = HashMap::new();
        let mut order: Vec<(DateTime<Utc>, String)> = Vec::new();

        for row in rows {
            let datetime: DateTime<Utc> = row.get("datetime");
            let model: String = row.get("model");
            let variable: String = row.get("variable");
            let value: Option<f64> = row.get("value");

            let key = (datetime, model.clone());
            if !records.contains_key(&key) {
                order.push(key.clone());
                records.insert(key.clone(), Record::new(datetime, external_id, model));
            }
            records.get_mut(&key).unwrap().variables.insert(variable, value);
        }

        let mut out: Vec<Record> = order.into_iter().filter_map(|k| records.remove(&k)).collect();
        out.sort_by_key(|r| r.datetime);
        Ok(Frame::from_records(out))
    }

    async fn insert_measurements(&self, frame: &Frame, adapter: &dyn ProviderAdapter) -> MeteoResult<()> {
        if frame.is_empty() {
            return Ok(());
        }

        // Group by external station id first (mirrors insert_data's
        // `df.groupby('station_id')` station-resolution pass), then resolve
        // each station once before touching any measurement rows.
        let mut by_station: BTreeMap<String, Vec<&Record>> = BTreeMap::new();
        for record in frame.iter() {
            by_station.entry(record.station_id.clone()).or_default().push(record);
        }

        for (station_ext, records) in by_station {
            let station = match self.ensure_station(adapter, &station_ext, StationInfo::default()).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(station = %station_ext, error = %e, "dropping batch: station could not be resolved");
                    continue;
                }
            };

            for record in records {
                for (var_name, value) in &record.variables {
                    let variable = match self.ensure_variable(var_name).await {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(variable = %var_name, error = %e, "dropping row: variable could not be resolved");
                            continue;
                        }
                    };

                    // Last-write-wins upsert; each row commits independently
                    // so a later failure never rolls back earlier successes
                    // (spec §4.1 failure semantics).
                    let result = sqlx::query(
                        "INSERT INTO measurements (station_id, variable_id, model, datetime, value)
                         VALUES ($1, $2, $3, $4, $5)
                         ON CONFLICT (station_id, variable_id, model, datetime)
                         DO UPDATE SET value = EXCLUDED.value",
                    )
                    .bind(station.id)
                    .bind(variable.id)
                    .bind(&record.model)
                    .bind(record.datetime)
                    .bind(value)
                    .execute(&self.pool)
                    .await;

                    if let Err(e) = result {
                        tracing::warn!(station = %station_ext, variable = %var_name, datetime = %record.datetime, error = %e, "measurement upsert failed");
                    }
                }
            }
        }

        Ok(())
    }
}
