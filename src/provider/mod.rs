//! Provider Adapter contract (spec §4.3): a uniform interface over wildly
//! different upstream meteorological APIs.
//!
//! Grounded on `original_source/src/meteo/base.py::BaseMeteoHandler`. The
//! Python base class carries an `asyncio.Semaphore` for rate limiting and an
//! `httpx.AsyncClient` opened/closed via `__aenter__`/`__aexit__`; here the
//! semaphore is a `tokio::sync::Semaphore` and the open/close state machine
//! is a small atomic refcount guarded by an RAII [`OpenGuard`], since
//! `reqwest::Client` is itself a cheap-to-clone handle over a pooled
//! connector and does not need the open/close dance the Python client does.

pub mod forecast;
pub mod observational;
pub mod registry;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{MeteoError, MeteoResult};
use crate::frequency::Inclusive;
use crate::record::{Frame, StationInfo};

/// Parameters for a single "fetch one sub-range" call to a provider.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub station_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sensors: Option<Vec<String>>,
    pub models: Option<Vec<String>>,
}

/// Rate-limit / resource parameters from the provider descriptor (spec §3).
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub max_concurrent_requests: usize,
    pub inter_request_delay: std::time::Duration,
    pub timeout: std::time::Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit {
            max_concurrent_requests: 5,
            inter_request_delay: std::time::Duration::from_secs(1),
            timeout: std::time::Duration::from_secs(20),
        }
    }
}

/// Shared internal state every adapter owns: the HTTP client and the
/// counting semaphore bounding concurrent upstream calls (spec §4.3 /
/// §5 "Shared resources").
pub struct AdapterState {
    pub client: reqwest::Client,
    pub semaphore: Arc<tokio::sync::Semaphore>,
    pub inter_request_delay: std::time::Duration,
    open_count: AtomicUsize,
}

impl AdapterState {
    pub fn new(rate_limit: &RateLimit) -> Self {
        let permits = rate_limit.max_concurrent_requests.max(1);
        let client = reqwest::Client::builder()
            .timeout(rate_limit.timeout)
            .build()
            .expect("building reqwest client with static config cannot fail");

        AdapterState {
            client,
            semaphore: Arc::new(tokio::sync::Semaphore::new(permits)),
            inter_request_delay: rate_limit.inter_request_delay,
            open_count: AtomicUsize::new(0),
        }
    }

    fn mark_open(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    fn mark_close(&self) {
        self.open_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open_count.load(Ordering::SeqCst) > 0
    }

    #[cfg(test)]
    pub fn mark_open_for_test(&self) {
        self.mark_open();
    }
}

/// RAII scoped-acquisition guard. Holding one puts the adapter in the
/// `open` state (spec §4.3's state machine); dropping it releases one
/// reference. `open -> open` re-entry is a no-op in the sense that nested
/// guards simply increment/decrement the same counter.
pub struct OpenGuard {
    adapter: Arc<dyn ProviderAdapter>,
}

impl OpenGuard {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        adapter.state().mark_open();
        OpenGuard { adapter }
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.adapter.state().mark_close();
    }
}

/// Uniform contract over observational and forecast providers (spec §4.3).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;
    /// Native sampling frequency, e.g. `"10min"`, `"h"`.
    fn freq(&self) -> &str;
    fn inclusive(&self) -> Inclusive;
    fn can_forecast(&self) -> bool;
    fn cache_data(&self) -> bool;
    fn latest_window(&self) -> Duration;
    fn forecast_window(&self) -> Duration;

    /// Access to the shared adapter state the open/close machinery and rate
    /// limiter operate on.
    fn state(&self) -> &AdapterState;

    async fn list_stations(&self) -> MeteoResult<Vec<String>>;
    async fn get_station_info(&self, external_id: &str) -> MeteoResult<StationInfo>;
    async fn get_sensors(&self, external_id: &str) -> MeteoResult<Vec<String>>;

    /// Perform one or many upstream calls covering `req`'s range, returning
    /// provider-native rows (opaque to everyone but this adapter's
    /// `transform`) plus station metadata. Must return
    /// [`MeteoError::NotOpen`] unless called within a scoped acquisition
    /// (see [`OpenGuard`]).
    async fn fetch_raw(&self, req: &FetchRequest) -> MeteoResult<(serde_json::Value, StationInfo)>;

    /// Normalize provider-native rows into the canonical [`Frame`] shape
    /// (spec §3 invariants: UTC datetime, one row per instant/station/model).
    fn transform(&self, raw: serde_json::Value, req: &FetchRequest) -> MeteoResult<Frame>;

    /// Enforce the canonical schema (columns present, correct types).
    fn validate(&self, frame: Frame) -> MeteoResult<Frame>;

    /// Convenience pipeline: `fetch_raw -> transform -> validate`.
    async fn run(&self, req: &FetchRequest) -> MeteoResult<Option<Frame>> {
        if !self.state().is_open() {
            return Err(MeteoError::NotOpen);
        }
        let (raw, _info) = self.fetch_raw(req).await?;
        if raw.is_null() {
            return Ok(None);
        }
        let transformed = self.transform(raw, req)?;
        if transformed.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.validate(transformed)?))
    }
}

/// Open a scoped acquisition on `adapter`, marking it `open` for the
/// lifetime of the returned guard.
pub fn open(adapter: Arc<dyn ProviderAdapter>) -> OpenGuard {
    OpenGuard::new(adapter)
}

/// Acquire a rate-limit permit, perform `body`, then sleep the mandatory
/// inter-request delay before releasing the permit -- mirrors
/// `province.py::_create_request_task`'s
/// `async with self._semaphore: ...; await asyncio.sleep(self.sleep_time)`.
pub async fn rate_limited<F, Fut, T>(state: &AdapterState, body: F) -> MeteoResult<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = MeteoResult<T>>,
{
    let _permit = state
        .semaphore
        .acquire()
        .await
        .expect("semaphore is never closed for the adapter's lifetime");
    let result = body().await;
    tokio::time::sleep(state.inter_request_delay).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use std::sync::Mutex;

    struct StubAdapter {
        state: AdapterState,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        fn name(&self) -> &str {
            "stub"
        }
        fn freq(&self) -> &str {
            "10min"
        }
        fn inclusive(&self) -> Inclusive {
            Inclusive::Both
        }
        fn can_forecast(&self) -> bool {
            false
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
            Ok(vec!["s1".to_string()])
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
            *self.calls.lock().unwrap() += 1;
            Ok((serde_json::json!({"ok": true}), StationInfo::default()))
        }
        fn transform(&self, _raw: serde_json::Value, req: &FetchRequest) -> MeteoResult<Frame> {
            Ok(Frame::from_records(vec![Record::new(
                req.start,
                &req.station_id,
                "",
            )
            .with_variable("tair_2m", Some(1.0))]))
        }
        fn validate(&self, frame: Frame) -> MeteoResult<Frame> {
            Ok(frame)
        }
    }

    fn stub() -> Arc<StubAdapter> {
        Arc::new(StubAdapter {
            state: AdapterState::new(&RateLimit::default()),
            calls: Mutex::new(0),
        })
    }

    #[tokio::test]
    async fn fetch_raw_outside_open_fails() {
        let adapter = stub();
        let req = FetchRequest {
            station_id: "s1".to_string(),
            start: Utc::now(),
            end: Utc::now(),
            sensors: None,
            models: None,
        };
        let result = adapter.run(&req).await;
        assert!(matches!(result, Err(MeteoError::NotOpen)));
    }

    #[tokio::test]
    async fn run_succeeds_within_scope() {
        let adapter = stub();
        let req = FetchRequest {
            station_id: "s1".to_string(),
            start: Utc::now(),
            end: Utc::now(),
            sensors: None,
            models: None,
        };
        let guard = open(adapter.clone());
        let result = adapter.run(&req).await.unwrap();
        assert!(result.is_some());
        drop(guard);
        assert!(adapter.run(&req).await.is_err());
    }

    #[tokio::test]
    async fn open_is_refcounted() {
        let adapter = stub();
        let g1 = open(adapter.clone());
        let g2 = open(adapter.clone());
        drop(g1);
        assert!(adapter.state().is_open());
        drop(g2);
        assert!(!adapter.state().is_open());
    }
}
