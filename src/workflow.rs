//! Workflow (spec §4.5): the thin coordinator above the Query Manager.
//!
//! Grounded on `original_source/src/workflow.py::QueryWorkflow.run_timeseries_query`:
//! resolves the effective timezone, fills in an implicit window when `start`
//! or `end` is missing, rejects `agg` together with `latest`, calls
//! [`crate::query_manager::get_data`], optionally resamples, resolves station
//! metadata (cache first, adapter best-effort fallback), and shapes the
//! response. Persistence of the pending frame is scheduled on a detached
//! task by the caller (see `routes/timeseries.rs`), matching `workflow.py`'s
//! `(response, pending)` return and spec.md §9's resolution in favor of
//! background writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{MeteoError, MeteoResult};
use crate::provider::ProviderAdapter;
use crate::query_manager;
use crate::record::{Frame, StationInfo};
use crate::resample::{resample, AggFn};
use crate::store::CacheStore;

/// A resolved timeseries request (spec §3's *Query*, post-resolution). Start
/// and end are always present and UTC by the time this reaches the Query
/// Manager; `timezone` records the zone the caller's naive bounds (if any)
/// were interpreted in, and the zone the response is reported in.
#[derive(Debug, Clone)]
pub struct TimeseriesQuery {
    pub provider: String,
    pub station_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub variables: Option<Vec<String>>,
    pub models: Option<Vec<String>>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub provider: String,
    pub station: String,
    pub name: Option<String>,
    pub elevation: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub variables: Vec<String>,
    pub query_timezone: String,
    pub result_timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

/// A [`crate::record::Record`] rendered for the wire: same shape, but
/// `datetime` carries the result timezone's offset (spec §4.4 step 10,
/// §6, invariant §8.8) instead of the pipeline's internal UTC.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseRecord {
    pub datetime: DateTime<FixedOffset>,
    pub station_id: String,
    #[serde(default)]
    pub model: String,
    pub variables: BTreeMap<String, Option<f64>>,
}

fn to_response_record(record: crate::record::Record, tz: Tz) -> ResponseRecord {
    ResponseRecord {
        datetime: record.datetime.with_timezone(&tz).fixed_offset(),
        station_id: record.station_id,
        model: record.model,
        variables: record.variables,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeseriesResponse {
    pub data: Vec<ResponseRecord>,
    pub count: usize,
    pub time_range: Option<TimeRange>,
    pub metadata: Option<ResponseMetadata>,
}

impl TimeseriesResponse {
    /// Mirrors `TimeseriesResponse.from_dataframe`: an empty frame yields an
    /// all-`None`/empty response; `latest` keeps only the single
    /// most-recent row. Every timestamp is reconverted to `tz` (spec §4.4
    /// step 6/10, invariant §8.8) before leaving the pipeline's internal UTC.
    fn from_frame(frame: Frame, latest: bool, metadata: Option<ResponseMetadata>, tz: Tz) -> Self {
        if frame.is_empty() {
            return TimeseriesResponse {
                data: vec![],
                count: 0,
                time_range: None,
                metadata: None,
            };
        }

        let mut frame = frame;
        frame.sort_by_datetime();
        let time_range = frame.time_range().map(|(start, end)| TimeRange {
            start: start.with_timezone(&tz).fixed_offset(),
            end: end.with_timezone(&tz).fixed_offset(),
        });

        let mut rows = frame.into_inner();
        if latest {
            if let Some(last) = rows.pop() {
                rows = vec![last];
            }
        }

        let data: Vec<ResponseRecord> = rows.into_iter().map(|r| to_response_record(r, tz)).collect();

        TimeseriesResponse {
            count: data.len(),
            data,
            time_range,
            metadata,
        }
    }
}

/// Resolve the effective timezone for `query` (spec §4.5 bullet 1):
/// `query.timezone`, else the zone of a provided zoned bound, else the
/// configured default. Since this crate keeps bounds as `DateTime<Utc>`
/// rather than carrying a separate naive/zoned distinction, an explicit
/// `query.timezone` is authoritative whenever given; it exists purely to
/// resolve *naive* wall-clock inputs before they reach this stage (done by
/// the HTTP layer) and to report back in `result_timezone`.
fn resolve_timezone(query: &TimeseriesQuery, default_timezone: &str) -> MeteoResult<Tz> {
    let name = query.timezone.as_deref().unwrap_or(default_timezone);
    name.parse::<Tz>()
        .map_err(|_| MeteoError::InvalidRange(format!("unknown timezone '{name}'")))
}

/// Run one resolved timeseries query end to end (spec §4.5).
///
/// `latest` and `agg` are mutually exclusive (*AggLatestConflict*).
#[allow(clippy::too_many_arguments)]
pub async fn run_timeseries_query(
    store: &dyn CacheStore,
    adapter: Arc<dyn ProviderAdapter>,
    default_timezone: &str,
    resample_colmap: &HashMap<String, AggFn>,
    mut query: TimeseriesQuery,
    latest: bool,
    agg: Option<&str>,
    min_size: Option<usize>,
) -> MeteoResult<(TimeseriesResponse, Frame)> {
    if latest && agg.is_some() {
        return Err(MeteoError::AggLatestConflict);
    }

    let tz = resolve_timezone(&query, default_timezone)?;
    let tz_name = query.timezone.clone().unwrap_or_else(|| default_timezone.to_string());
    query.timezone = Some(tz_name.clone());

    let now = Utc::now();

    if let Some(start) = query.start_time {
        if !adapter.can_forecast() && start > now {
            return Err(MeteoError::PastOnly);
        }
    }

    let window = if adapter.can_forecast() {
        adapter.forecast_window()
    } else {
        adapter.latest_window()
    };

    let end_time = match query.end_time {
        Some(end) => end,
        None => match query.start_time {
            Some(start) if adapter.can_forecast() && start > now => start + window,
            _ => now,
        },
    };

    let start_time = query.start_time.unwrap_or(end_time - window);

    if start_time >= end_time {
        return Err(MeteoError::InvalidRange(
            "start_time must be before end_time".to_string(),
        ));
    }

    query.start_time = Some(start_time);
    query.end_time = Some(end_time);

    let outcome = query_manager::get_data(
        store,
        adapter.clone(),
        &query.station_id,
        start_time,
        end_time,
        query.variables.as_deref(),
        query.models.as_deref(),
    )
    .await?;

    let combined = if let Some(freq_str) = agg {
        if combined_is_empty(&outcome.combined) {
            outcome.combined
        } else {
            let freq = crate::frequency::parse_freq(freq_str)?;
            resample(&outcome.combined, freq, min_size.unwrap_or(1), resample_colmap)
        }
    } else {
        outcome.combined
    };

    // Station info: cache first, provider best-effort fallback -- mirrors
    // `run_timeseries_query`'s `db.query_station(...)` then
    // `provider.get_station_info(...)` on miss.
    let station_info = match store.find_station(adapter.name(), &query.station_id).await {
        Ok(Some(station)) => StationInfo {
            name: station.name,
            latitude: station.latitude,
            longitude: station.longitude,
            elevation: station.elevation,
            extra: HashMap::new(),
        },
        _ => match adapter.get_station_info(&query.station_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(station_id = %query.station_id, error = %e, "station info lookup failed for response metadata");
                StationInfo::default()
            }
        },
    };

    let metadata = ResponseMetadata {
        provider: adapter.name().to_string(),
        station: query.station_id.clone(),
        name: station_info.name,
        elevation: station_info.elevation,
        latitude: station_info.latitude,
        longitude: station_info.longitude,
        variables: combined.variable_names(),
        query_timezone: tz_name,
        result_timezone: tz.to_string(),
    };

    let response = TimeseriesResponse::from_frame(combined, latest, Some(metadata), tz);

    Ok((response, outcome.pending))
}

fn combined_is_empty(frame: &Frame) -> bool {
    frame.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frequency::Inclusive;
    use crate::provider::{AdapterState, FetchRequest, RateLimit};
    use crate::record::{Frame, Record};
    use crate::store::Station;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex as StdMutex;

    struct FakeAdapter {
        state: AdapterState,
        can_forecast: bool,
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn name(&self) -> &str {
            "province"
        }
        fn freq(&self) -> &str {
            "10min"
        }
        fn inclusive(&self) -> Inclusive {
            Inclusive::Both
        }
        fn can_forecast(&self) -> bool {
            self.can_forecast
        }
        fn cache_data(&self) -> bool {
            true
        }
        fn latest_window(&self) -> Duration {
            Duration::hours(1)
        }
        fn forecast_window(&self) -> Duration {
            Duration::hours(6)
        }
        fn state(&self) -> &AdapterState {
            &self.state
        }
        async fn list_stations(&self) -> MeteoResult<Vec<String>> {
            Ok(vec![])
        }
        async fn get_station_info(&self, _external_id: &str) -> MeteoResult<StationInfo> {
            Ok(StationInfo::default())
        }
        async fn get_sensors(&self, _external_id: &str) -> MeteoResult<Vec<String>> {
            Ok(vec![])
        }
        async fn fetch_raw(&self, _req: &FetchRequest) -> MeteoResult<(serde_json::Value, StationInfo)> {
            Ok((serde_json::Value::Null, StationInfo::default()))
        }
        fn transform(&self, _raw: serde_json::Value, _req: &FetchRequest) -> MeteoResult<Frame> {
            Ok(Frame::new())
        }
        fn validate(&self, frame: Frame) -> MeteoResult<Frame> {
            Ok(frame)
        }
    }

    struct FakeStore {
        cached: StdMutex<Frame>,
    }

    #[async_trait]
    impl CacheStore for FakeStore {
        async fn list_providers(&self) -> MeteoResult<Vec<String>> {
            Ok(vec![])
        }
        async fn find_station(&self, _provider: &str, _external_id: &str) -> MeteoResult<Option<Station>> {
            Ok(None)
        }
        async fn list_stations(&self, _provider: Option<&str>) -> MeteoResult<Vec<Station>> {
            Ok(vec![])
        }
        async fn ensure_station(
            &self,
            _adapter: &dyn ProviderAdapter,
            _external_id: &str,
            _extra_attrs: StationInfo,
        ) -> MeteoResult<Station> {
            unimplemented!("not exercised by workflow tests")
        }
        async fn ensure_variable(&self, _name: &str) -> MeteoResult<crate::store::Variable> {
            unimplemented!("not exercised by workflow tests")
        }
        async fn query_measurements(
            &self,
            _provider: &str,
            _external_id: &str,
            _start_utc: DateTime<Utc>,
            _end_utc: DateTime<Utc>,
            _variables: Option<&[String]>,
            _models: Option<&[String]>,
        ) -> MeteoResult<Frame> {
            Ok(self.cached.lock().unwrap().clone())
        }
        async fn insert_measurements(&self, _frame: &Frame, _adapter: &dyn ProviderAdapter) -> MeteoResult<()> {
            Ok(())
        }
    }

    fn base_query(station_id: &str) -> TimeseriesQuery {
        TimeseriesQuery {
            provider: "province".to_string(),
            station_id: station_id.to_string(),
            start_time: None,
            end_time: None,
            variables: None,
            models: None,
            timezone: None,
        }
    }

    #[tokio::test]
    async fn agg_and_latest_together_is_rejected() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(FakeAdapter {
            state: AdapterState::new(&RateLimit::default()),
            can_forecast: false,
        });
        let store = FakeStore {
            cached: StdMutex::new(Frame::new()),
        };
        let result = run_timeseries_query(
            &store,
            adapter,
            "Europe/Rome",
            &HashMap::new(),
            base_query("01110MS"),
            true,
            Some("1d"),
            None,
        )
        .await;
        assert!(matches!(result, Err(MeteoError::AggLatestConflict)));
    }

    #[tokio::test]
    async fn future_start_rejected_for_non_forecast_provider() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(FakeAdapter {
            state: AdapterState::new(&RateLimit::default()),
            can_forecast: false,
        });
        let store = FakeStore {
            cached: StdMutex::new(Frame::new()),
        };
        let mut query = base_query("01110MS");
        query.start_time = Some(Utc::now() + Duration::hours(1));
        let result = run_timeseries_query(&store, adapter, "Europe/Rome", &HashMap::new(), query, false, None, None).await;
        assert!(matches!(result, Err(MeteoError::PastOnly)));
    }

    #[tokio::test]
    async fn empty_cache_yields_empty_response_with_no_metadata() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(FakeAdapter {
            state: AdapterState::new(&RateLimit::default()),
            can_forecast: false,
        });
        let store = FakeStore {
            cached: StdMutex::new(Frame::new()),
        };
        let (response, pending) = run_timeseries_query(
            &store,
            adapter,
            "Europe/Rome",
            &HashMap::new(),
            base_query("01110MS"),
            false,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.count, 0);
        assert!(response.time_range.is_none());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn latest_keeps_only_the_last_row() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(FakeAdapter {
            state: AdapterState::new(&RateLimit::default()),
            can_forecast: false,
        });
        let now = Utc::now();
        let r1 = Record::new(now - Duration::minutes(20), "01110MS", "").with_variable("tair_2m", Some(1.0));
        let r2 = Record::new(now - Duration::minutes(10), "01110MS", "").with_variable("tair_2m", Some(2.0));
        let store = FakeStore {
            cached: StdMutex::new(Frame::from_records(vec![r1, r2])),
        };
        let (response, _pending) = run_timeseries_query(
            &store,
            adapter,
            "Europe/Rome",
            &HashMap::new(),
            base_query("01110MS"),
            true,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.count, 1);
    }
}
