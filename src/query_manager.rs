//! Query Manager (spec §4.4): the central orchestrator. Produces two frames
//! -- the *combined* frame (cache union newly fetched, returned to the
//! caller) and the *pending* frame (only what is new, to be persisted by a
//! background task).
//!
//! Grounded on `original_source/webhandler/query_manager.py::QueryManager.get_data`
//! for the overall shape (validate -> round to grid -> read cache -> find
//! gaps -> fetch -> merge), with the **[ADDED]** concurrent-gap-fetch and
//! `(combined, pending)` split from `original_source/src/workflow.py`'s
//! newer calling convention (spec.md §9 Open Question, resolved in favor of
//! background writes).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;

use crate::error::{MeteoError, MeteoResult};
use crate::frequency::Inclusive;
use crate::gapfinder::{build_grid, default_min_gap_duration, find_gaps, floor_to_freq};
use crate::provider::{open, FetchRequest, ProviderAdapter};
use crate::record::Frame;
use crate::store::CacheStore;

/// `get_data`'s two-frame result (spec §4.4): `combined` is cache ∪ newly
/// fetched, shaped for the caller; `pending` is only what is new and must
/// still be persisted.
pub struct QueryOutcome {
    pub combined: Frame,
    pub pending: Frame,
}

/// Orchestrates the full read-through pipeline for one `(provider, station,
/// range)` request (spec §4.4 steps 1-11).
pub async fn get_data(
    store: &dyn CacheStore,
    adapter: Arc<dyn ProviderAdapter>,
    station_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    variables: Option<&[String]>,
    models: Option<&[String]>,
) -> MeteoResult<QueryOutcome> {
    // Step 1: validate times.
    if start >= end {
        return Err(MeteoError::InvalidRange(
            "start must be strictly before end".to_string(),
        ));
    }
    let now = Utc::now();
    if start > now && !adapter.can_forecast() {
        return Err(MeteoError::PastOnly);
    }

    // Step 2: at most one model per request (current core invariant, spec
    // §4.4 step 2 / S5).
    if let Some(models) = models {
        if models.len() > 1 {
            return Err(MeteoError::MultiModelUnsupported);
        }
    }

    let freq = crate::frequency::parse_freq(adapter.freq())?;

    // Step 3: round to grid, cap end at now.
    let start_utc = floor_to_freq(start, freq);
    let now_floor = floor_to_freq(now, freq);
    let mut end_utc = floor_to_freq(end, freq);
    if end_utc > now_floor && !adapter.can_forecast() {
        tracing::warn!(
            requested_end = %end_utc,
            capped_end = %now_floor,
            "capping requested end to now"
        );
        end_utc = now_floor;
    }
    if end_utc <= start_utc {
        return Ok(QueryOutcome {
            combined: Frame::new(),
            pending: Frame::new(),
        });
    }

    // Step 4: read cache.
    let cached = store
        .query_measurements(adapter.name(), station_id, start_utc, end_utc, variables, models)
        .await?;

    let existing_instants: Vec<DateTime<Utc>> = cached.iter().map(|r| r.datetime).collect();

    // Step 5: find gaps.
    let gaps = find_gaps(
        &existing_instants,
        start_utc,
        end_utc,
        adapter.freq(),
        adapter.inclusive(),
        default_min_gap_duration(),
    );

    // Step 6: no gaps -> cache is authoritative.
    if gaps.is_empty() {
        return Ok(QueryOutcome {
            combined: cached,
            pending: Frame::new(),
        });
    }

    let expected_variables = cached.variable_names();
    let n = gaps.len();

    // Step 7: fetch gaps concurrently, one task per gap, all inside a single
    // scoped acquisition of the adapter (shared HTTP client + rate token).
    let guard = open(adapter.clone());
    let tasks = gaps.into_iter().enumerate().map(|(i, (gap_start, gap_end))| {
        let adapter = adapter.clone();
        let station_id = station_id.to_string();
        let models = models.map(|m| m.to_vec());
        let variables = variables.map(|v| v.to_vec());
        async move {
            // Compensate for the provider's own half-open convention so the
            // canonical grid is still fully covered (spec §4.4 step 7).
            let (fetch_start, fetch_end) = match adapter.inclusive() {
                Inclusive::Left if i == n - 1 => (gap_start, gap_end + freq),
                Inclusive::Right if i == 0 => (gap_start - freq, gap_end),
                _ => (gap_start, gap_end),
            };

            let req = FetchRequest {
                station_id,
                start: fetch_start,
                end: fetch_end,
                sensors: variables,
                models,
            };

            let result = adapter.run(&req).await;
            (result, gap_start, gap_end)
        }
    });
    let results = join_all(tasks).await;
    drop(guard);

    // Step 8: reconcile each completed task.
    let mut gap_frames = Vec::with_capacity(results.len());
    for (result, gap_start, gap_end) in results {
        let grid = build_grid(gap_start, gap_end, freq, Inclusive::Both);

        match result {
            Ok(Some(frame)) => {
                let deduped = frame.dedup_keep_last();
                for ((group_station, group_model), records) in deduped.group_by_station_model() {
                    let reindexed = Frame::from_records(records).reindex_to_grid(
                        &group_station,
                        &group_model,
                        &grid,
                        &expected_variables,
                    );
                    gap_frames.push(reindexed);
                }
            }
            Ok(None) => {
                // Provider returned nothing: emit explicit gap markers for
                // every requested model (or the default "" observation
                // model), recording "upstream confirmed no data here".
                let markers: Vec<String> = match models {
                    Some(m) if !m.is_empty() => m.to_vec(),
                    _ => vec![String::new()],
                };
                for model in markers {
                    gap_frames.push(Frame::new().reindex_to_grid(
                        station_id,
                        &model,
                        &grid,
                        &expected_variables,
                    ));
                }
            }
            Err(e) => {
                // A single gap task failure never fails the whole request
                // (spec §4.4 failure semantics); log and move on.
                tracing::warn!(station_id, %gap_start, %gap_end, error = %e, "gap fetch failed");
            }
        }
    }

    // Step 9: concatenate all gap frames -> new_data (pending).
    let mut new_data = Frame::new();
    for frame in gap_frames {
        new_data.extend(frame);
    }
    new_data = new_data.dedup_keep_last();

    // Step 10: merge, last-write-wins on (station_id, model, datetime).
    let combined = cached.merge_last_write_wins(new_data.clone());

    // Step 11.
    Ok(QueryOutcome { combined, pending: new_data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frequency::Inclusive;
    use crate::provider::{AdapterState, RateLimit};
    use crate::record::{Record, StationInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeAdapter {
        state: AdapterState,
        freq: &'static str,
        inclusive: Inclusive,
        can_forecast: bool,
        fetch_calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn name(&self) -> &str {
            "fake"
        }
        fn freq(&self) -> &str {
            self.freq
        }
        fn inclusive(&self) -> Inclusive {
            self.inclusive
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
            Duration::zero()
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
            Ok(vec!["tair_2m".to_string()])
        }
        async fn fetch_raw(
            &self,
            _req: &FetchRequest,
        ) -> MeteoResult<(serde_json::Value, StationInfo)> {
            // No gaps in the tests below ever reach this -- they either
            // fail validation first or find the cache already complete.
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
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
        frame: StdMutex<Frame>,
    }

    #[async_trait]
    impl CacheStore for FakeStore {
        async fn list_providers(&self) -> MeteoResult<Vec<String>> {
            Ok(vec![])
        }
        async fn find_station(&self, _provider: &str, _external_id: &str) -> MeteoResult<Option<crate::store::Station>> {
            Ok(None)
        }
        async fn list_stations(&self, _provider: Option<&str>) -> MeteoResult<Vec<crate::store::Station>> {
            Ok(vec![])
        }
        async fn ensure_station(
            &self,
            _adapter: &dyn ProviderAdapter,
            _external_id: &str,
            _extra_attrs: StationInfo,
        ) -> MeteoResult<crate::store::Station> {
            unimplemented!("not exercised by query_manager tests")
        }
        async fn ensure_variable(&self, _name: &str) -> MeteoResult<crate::store::Variable> {
            unimplemented!("not exercised by query_manager tests")
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
            Ok(self.frame.lock().unwrap().clone())
        }
        async fn insert_measurements(&self, frame: &Frame, _adapter: &dyn ProviderAdapter) -> MeteoResult<()> {
            let mut guard = self.frame.lock().unwrap();
            *guard = guard.clone().merge_last_write_wins(frame.clone());
            Ok(())
        }
    }

    fn fake_adapter() -> Arc<FakeAdapter> {
        Arc::new(FakeAdapter {
            state: AdapterState::new(&RateLimit::default()),
            freq: "10min",
            inclusive: Inclusive::Both,
            can_forecast: false,
            fetch_calls: AtomicUsize::new(0),
        })
    }

    fn fake_forecast_adapter() -> Arc<FakeAdapter> {
        Arc::new(FakeAdapter {
            state: AdapterState::new(&RateLimit::default()),
            freq: "10min",
            inclusive: Inclusive::Both,
            can_forecast: true,
            fetch_calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn cache_authority_skips_fetch_when_grid_is_complete() {
        let start = Utc::now() - Duration::hours(2);
        let end = Utc::now() - Duration::hours(1);
        let start_floor = floor_to_freq(start, Duration::minutes(10));
        let end_floor = floor_to_freq(end, Duration::minutes(10));
        let grid = build_grid(start_floor, end_floor, Duration::minutes(10), Inclusive::Both);

        let mut records = Vec::new();
        for t in &grid {
            records.push(Record::new(*t, "s1", "").with_variable("tair_2m", Some(1.0)));
        }
        let store = FakeStore {
            frame: StdMutex::new(Frame::from_records(records)),
        };
        let adapter = fake_adapter();

        let outcome = get_data(&store, adapter.clone(), "s1", start, end, None, None)
            .await
            .unwrap();

        assert!(outcome.pending.is_empty());
        assert_eq!(outcome.combined.len(), grid.len());
        assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_range_is_rejected() {
        let store = FakeStore { frame: StdMutex::new(Frame::new()) };
        let adapter = fake_adapter();
        let now = Utc::now();
        let result = get_data(&store, adapter, "s1", now, now - Duration::hours(1), None, None).await;
        assert!(matches!(result, Err(MeteoError::InvalidRange(_))));
    }

    #[tokio::test]
    async fn future_start_rejected_for_non_forecast() {
        let store = FakeStore { frame: StdMutex::new(Frame::new()) };
        let adapter = fake_adapter();
        let now = Utc::now();
        let result = get_data(
            &store,
            adapter,
            "s1",
            now + Duration::hours(1),
            now + Duration::hours(2),
            None,
            None,
        )
        .await;
        assert!(matches!(result, Err(MeteoError::PastOnly)));
    }

    #[tokio::test]
    async fn forecast_adapter_accepts_future_window() {
        // Spec §4.5/S5: a forecast-capable adapter must be able to query a
        // window entirely in the future, uncapped at `now`.
        let store = FakeStore { frame: StdMutex::new(Frame::new()) };
        let adapter = fake_forecast_adapter();
        let now = Utc::now();
        let outcome = get_data(
            &store,
            adapter,
            "s1",
            now + Duration::hours(1),
            now + Duration::hours(2),
            None,
            None,
        )
        .await
        .unwrap();

        // The adapter's `fetch_raw` returns a null payload, so `run` reports
        // "upstream confirmed no data" and the gap is filled with explicit
        // markers spanning the whole future window -- proof the window
        // reached the fetch stage instead of being rejected or collapsed.
        assert!(!outcome.pending.is_empty());
        assert_eq!(outcome.combined.len(), outcome.pending.len());
    }

    #[tokio::test]
    async fn multiple_models_rejected() {
        let store = FakeStore { frame: StdMutex::new(Frame::new()) };
        let adapter = fake_adapter();
        let now = Utc::now();
        let models = vec!["a".to_string(), "b".to_string()];
        let result = get_data(
            &store,
            adapter,
            "s1",
            now - Duration::hours(1),
            now,
            None,
            Some(&models),
        )
        .await;
        assert!(matches!(result, Err(MeteoError::MultiModelUnsupported)));
    }
}
