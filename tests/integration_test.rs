//! Black-box integration test against a running `meteo-cache` instance.
//!
//! Mirrors the teacher's `tests/integration_test.rs` shape (plain
//! `reqwest::Client` hitting `localhost:8080`) but exercises this crate's
//! surface: `/health` and `/api/timeseries`. Requires the server (and a
//! reachable Postgres instance) to already be running, same precondition as
//! the teacher's test.

use anyhow::Result;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct TimeseriesRecord {
    datetime: String,
    station_id: String,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct TimeRange {
    #[allow(dead_code)]
    start: String,
    #[allow(dead_code)]
    end: String,
}

#[derive(Debug, Deserialize)]
struct TimeseriesResponse {
    data: Vec<TimeseriesRecord>,
    count: usize,
    time_range: Option<TimeRange>,
}

#[tokio::test]
async fn health_endpoint_reports_ok() -> Result<()> {
    let client = Client::new();
    let response = client.get("http://localhost:8080/health").send().await?;
    assert!(response.status().is_success());

    let body: HealthResponse = response.json().await?;
    assert_eq!(body.status, "ok");
    Ok(())
}

#[tokio::test]
async fn timeseries_endpoint_returns_a_dense_consistent_series() -> Result<()> {
    let client = Client::new();
    let response = client
        .get("http://localhost:8080/api/timeseries")
        .query(&[
            ("provider", "province"),
            ("station_id", "01110MS"),
            ("start_time", "2025-06-01T00:00:00Z"),
            ("end_time", "2025-06-01T01:00:00Z"),
        ])
        .send()
        .await?;

    assert!(response.status().is_success(), "request failed: {}", response.status());

    let body: TimeseriesResponse = response.json().await?;
    assert_eq!(body.count, body.data.len());

    if !body.data.is_empty() {
        assert!(body.time_range.is_some());
        for record in &body.data {
            assert_eq!(record.station_id, "01110MS");
            assert!(record.model.is_empty());
            assert!(chrono::DateTime::parse_from_rfc3339(&record.datetime).is_ok());
        }
    }

    Ok(())
}

#[tokio::test]
async fn unknown_provider_is_rejected() -> Result<()> {
    let client = Client::new();
    let response = client
        .get("http://localhost:8080/api/timeseries")
        .query(&[("provider", "not-a-real-provider"), ("station_id", "x")])
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}