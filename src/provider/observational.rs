//! Observational provider variant (spec §4.3): one sensor per upstream
//! call, chunked by a max-days window and (optionally) split at calendar
//! year boundaries, with DST-aware localization of naive provider
//! timestamps.
//!
//! Grounded on `original_source/src/meteo/province.py::ProvinceMeteo` and
//! `original_source/src/utils.py::split_dates`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{MeteoError, MeteoResult};
use crate::frequency::Inclusive;
use crate::gapfinder::floor_to_freq;
use crate::record::{Frame, Record, StationInfo};

use super::{rate_limited, AdapterState, FetchRequest, ProviderAdapter, RateLimit};

/// Upstream sensor code -> canonical variable name, mirroring
/// `province.py::PROVINCE_RENAME`.
fn province_rename(sensor_code: &str) -> String {
    match sensor_code {
        "LT" => "tair_2m",
        "LF" => "relative_humidity",
        "N" => "precipitation",
        "WG" => "wind_speed",
        "WR" => "wind_direction",
        "WG.BOE" => "wind_gust",
        "LD.RED" => "air_pressure",
        "SD" => "sun_duration",
        "GS" => "solar_radiation",
        "HS" => "snow_height",
        "W" => "water_level",
        "Q" => "discharge",
        other => other,
    }
    .to_string()
}

/// Split `[start, end]` into `(start, end)` sub-ranges each spanning at most
/// `n_days`, optionally cut again at Dec 31 of `start`'s year. Ported from
/// `utils.py::split_dates`.
pub fn split_dates(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    n_days: i64,
    split_on_year: bool,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    if end < start {
        return vec![];
    }

    let mut pairs = Vec::new();
    let mut current_start = start;

    while current_start < end {
        let potential_end = current_start + Duration::days(n_days);
        let mut current_end = potential_end.min(end);

        if split_on_year && current_end.date_naive().year() != current_start.date_naive().year() {
            current_end = Utc
                .with_ymd_and_hms(current_start.date_naive().year(), 12, 31, 23, 59, 59)
                .unwrap();
        }

        pairs.push((current_start, current_end));
        current_start = current_end;
    }

    pairs
}

use chrono::Datelike;

#[derive(Debug, Deserialize)]
struct SensorEntry {
    #[serde(rename = "TYPE")]
    type_: String,
}

#[derive(Debug, Deserialize)]
struct StationFeature {
    properties: StationProperties,
}

#[derive(Debug, Deserialize)]
struct StationProperties {
    #[serde(rename = "LAT")]
    lat: Option<f64>,
    #[serde(rename = "LONG")]
    lon: Option<f64>,
    #[serde(rename = "ALT")]
    alt: Option<f64>,
    #[serde(rename = "NAME_D")]
    name: Option<String>,
    #[serde(rename = "SCODE")]
    scode: String,
}

#[derive(Debug, Deserialize)]
struct StationsResponse {
    features: Vec<StationFeature>,
}

#[derive(Debug, Deserialize)]
struct TimeseriesEntry {
    #[serde(rename = "DATE")]
    date: String,
    #[serde(rename = "VALUE")]
    value: Option<f64>,
}

pub struct ProvinceAdapter {
    state: AdapterState,
    timezone: chrono_tz::Tz,
    base_url: String,
    chunk_size_days: i64,
    latest_window: Duration,
    station_info: Mutex<Option<HashMap<String, StationInfo>>>,
    station_sensors: Mutex<HashMap<String, Vec<String>>>,
}

impl ProvinceAdapter {
    pub fn new(base_url: impl Into<String>, timezone: chrono_tz::Tz, rate_limit: RateLimit) -> Self {
        ProvinceAdapter {
            state: AdapterState::new(&rate_limit),
            timezone,
            base_url: base_url.into(),
            chunk_size_days: 365,
            latest_window: Duration::hours(24),
            station_info: Mutex::new(None),
            station_sensors: Mutex::new(HashMap::new()),
        }
    }

    fn stations_url(&self) -> String {
        format!("{}/stations", self.base_url)
    }

    fn sensors_url(&self) -> String {
        format!("{}/sensors", self.base_url)
    }

    fn timeseries_url(&self) -> String {
        format!("{}/timeseries", self.base_url)
    }

    async fn ensure_station_info(&self) -> MeteoResult<HashMap<String, StationInfo>> {
        {
            let guard = self.station_info.lock().await;
            if let Some(info) = guard.as_ref() {
                return Ok(info.clone());
            }
        }

        let response = self
            .state
            .client
            .get(self.stations_url())
            .send()
            .await
            .map_err(|e| MeteoError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| MeteoError::Upstream(e.to_string()))?
            .json::<StationsResponse>()
            .await
            .map_err(|e| MeteoError::ProviderContract(e.to_string()))?;

        if response.features.is_empty() {
            return Err(MeteoError::ProviderContract(
                "station directory response contains no features".to_string(),
            ));
        }

        let mut map = HashMap::new();
        for feature in response.features {
            let props = feature.properties;
            map.insert(
                props.scode.clone(),
                StationInfo {
                    name: props.name,
                    latitude: props.lat,
                    longitude: props.lon,
                    elevation: props.alt,
                    extra: HashMap::new(),
                },
            );
        }

        let mut guard = self.station_info.lock().await;
        *guard = Some(map.clone());
        Ok(map)
    }

    async fn ensure_sensors(&self, station_id: &str) -> MeteoResult<Vec<String>> {
        {
            let guard = self.station_sensors.lock().await;
            if let Some(sensors) = guard.get(station_id) {
                return Ok(sensors.clone());
            }
        }

        let response = self
            .state
            .client
            .get(self.sensors_url())
            .query(&[("station_code", station_id)])
            .send()
            .await
            .map_err(|e| MeteoError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| MeteoError::Upstream(e.to_string()))?
            .json::<Vec<SensorEntry>>()
            .await
            .map_err(|e| MeteoError::ProviderContract(e.to_string()))?;

        let mut seen = std::collections::BTreeSet::new();
        let mut sensors = Vec::new();
        for entry in response {
            if seen.insert(entry.type_.clone()) {
                sensors.push(entry.type_);
            }
        }

        let mut guard = self.station_sensors.lock().await;
        guard.insert(station_id.to_string(), sensors.clone());
        Ok(sensors)
    }

    async fn request_one_sensor(
        &self,
        station_id: &str,
        sensor: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Vec<Value>> {
        let url = self.timeseries_url();
        let params = [
            ("station_code", station_id.to_string()),
            ("sensor_code", sensor.to_string()),
            ("date_from", start.format("%Y%m%d%H%M").to_string()),
            ("date_to", end.format("%Y%m%d%H%M").to_string()),
        ];

        let result = rate_limited(&self.state, || async {
            self.state
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .map_err(|e| MeteoError::Upstream(e.to_string()))?
                .error_for_status()
                .map_err(|e| MeteoError::Upstream(e.to_string()))?
                .json::<Vec<TimeseriesEntry>>()
                .await
                .map_err(|e| MeteoError::ProviderContract(e.to_string()))
        })
        .await;

        match result {
            Ok(entries) if !entries.is_empty() => Some(
                entries
                    .into_iter()
                    .map(|e| {
                        serde_json::json!({
                            "DATE": e.date,
                            "VALUE": e.value,
                            "sensor": sensor,
                            "station_id": station_id,
                        })
                    })
                    .collect(),
            ),
            Ok(_) => {
                tracing::warn!(station_id, sensor, "no data found for sensor/range");
                None
            }
            Err(e) => {
                tracing::error!(station_id, sensor, error = %e, "error fetching province data");
                None
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for ProvinceAdapter {
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
        false
    }

    fn cache_data(&self) -> bool {
        true
    }

    fn latest_window(&self) -> Duration {
        self.latest_window
    }

    fn forecast_window(&self) -> Duration {
        Duration::zero()
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn list_stations(&self) -> MeteoResult<Vec<String>> {
        Ok(self.ensure_station_info().await?.into_keys().collect())
    }

    async fn get_station_info(&self, external_id: &str) -> MeteoResult<StationInfo> {
        Ok(self
            .ensure_station_info()
            .await?
            .get(external_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_sensors(&self, external_id: &str) -> MeteoResult<Vec<String>> {
        self.ensure_sensors(external_id).await
    }

    async fn fetch_raw(&self, req: &FetchRequest) -> MeteoResult<(Value, StationInfo)> {
        if !self.state.is_open() {
            return Err(MeteoError::NotOpen);
        }

        let stations = self.list_stations().await?;
        if !stations.contains(&req.station_id) {
            return Err(MeteoError::UnknownStation(
                req.station_id.clone(),
                self.name().to_string(),
            ));
        }

        let all_sensors = self.ensure_sensors(&req.station_id).await?;
        let sensors = match &req.sensors {
            Some(requested) => {
                for sensor in requested {
                    if !all_sensors.contains(sensor) {
                        return Err(MeteoError::ProviderContract(format!(
                            "invalid sensor '{sensor}' for station '{}'",
                            req.station_id
                        )));
                    }
                }
                requested.clone()
            }
            None => all_sensors,
        };

        let chunks = split_dates(req.start, req.end, self.chunk_size_days, true);

        let mut tasks = Vec::new();
        for (chunk_start, chunk_end) in &chunks {
            for sensor in &sensors {
                tasks.push(self.request_one_sensor(&req.station_id, sensor, *chunk_start, *chunk_end));
            }
        }

        let results = join_all(tasks).await;
        let rows: Vec<Value> = results.into_iter().flatten().flatten().collect();

        let info = self.get_station_info(&req.station_id).await.unwrap_or_default();

        if rows.is_empty() {
            tracing::warn!(station_id = %req.station_id, "no data could be fetched from province");
            return Ok((Value::Null, info));
        }

        Ok((Value::Array(rows), info))
    }

    fn transform(&self, raw: Value, req: &FetchRequest) -> MeteoResult<Frame> {
        let rows = match raw.as_array() {
            Some(rows) => rows,
            None => return Ok(Frame::new()),
        };

        // Dedup on (DATE, station_id, sensor), last write wins, then pivot
        // sensor -> canonical variable column.
        let mut by_key: HashMap<(String, String, String), (Option<f64>, String)> = HashMap::new();
        let mut order: Vec<(String, String, String)> = Vec::new();

        for row in rows {
            let date = row.get("DATE").and_then(Value::as_str).unwrap_or_default().to_string();
            let station_id = row
                .get("station_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let sensor = row
                .get("sensor")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let value = row.get("VALUE").and_then(Value::as_f64);

            let key = (date.clone(), station_id.clone(), sensor.clone());
            if !by_key.contains_key(&key) {
                order.push(key.clone());
            }
            by_key.insert(key, (value, date));
        }

        // Group by (date string, station_id) to build one Record per instant.
        let mut records: HashMap<(String, String), Record> = HashMap::new();
        let mut record_order: Vec<(String, String)> = Vec::new();

        for (date, station_id, sensor) in order {
            let (value, raw_date) = by_key.remove(&(date.clone(), station_id.clone(), sensor.clone())).unwrap();
            let instant = match parse_province_datetime(&raw_date, self.timezone) {
                Ok(dt) => floor_to_freq(dt, Duration::minutes(10)),
                Err(_) => continue,
            };

            let group_key = (date.clone(), station_id.clone());
            if !records.contains_key(&group_key) {
                record_order.push(group_key.clone());
                records.insert(group_key.clone(), Record::new(instant, station_id.clone(), ""));
            }
            let record = records.get_mut(&group_key).unwrap();
            record.variables.insert(province_rename(&sensor), value);
        }

        let out: Vec<Record> = record_order
            .into_iter()
            .filter_map(|k| records.remove(&k))
            .collect();

        // Drop rows where every variable other than precipitation is NULL
        // (precipitation reports at 5min freq while the rest report at
        // 10min; spec note in province.py::transform).
        let out: Vec<Record> = out
            .into_iter()
            .filter(|r| {
                r.variables
                    .iter()
                    .any(|(name, v)| name != "precipitation" && v.is_some())
                    || r.variables.is_empty()
            })
            .collect();

        let _ = req;
        Ok(Frame::from_records(out))
    }

    fn validate(&self, frame: Frame) -> MeteoResult<Frame> {
        Ok(frame)
    }
}

/// Parse a province timestamp string such as `"2025-06-01T14:30:00CEST"` or
/// `"...CET"`, disambiguating the UTC offset from the explicit zone
/// abbreviation rather than relying on ambiguous local-time resolution --
/// the upstream already tells us which side of the DST transition a reading
/// falls on. Mirrors `province.py::transform`'s `is_dst` mask approach.
fn parse_province_datetime(raw: &str, _tz: chrono_tz::Tz) -> MeteoResult<DateTime<Utc>> {
    let (naive_part, offset_hours) = if let Some(stripped) = raw.strip_suffix("CEST") {
        (stripped, 2)
    } else if let Some(stripped) = raw.strip_suffix("CET") {
        (stripped, 1)
    } else {
        (raw, 1)
    };

    let naive = chrono::NaiveDateTime::parse_from_str(naive_part, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| MeteoError::ProviderContract(format!("bad datetime '{raw}': {e}")))?;

    let fixed_offset = chrono::FixedOffset::east_opt(offset_hours * 3600)
        .expect("offset hours for CET/CEST are always in range");
    let local = fixed_offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| MeteoError::ProviderContract(format!("ambiguous local time '{raw}'")))?;

    Ok(local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn province_rename_maps_known_codes() {
        assert_eq!(province_rename("LT"), "tair_2m");
        assert_eq!(province_rename("N"), "precipitation");
        assert_eq!(province_rename("WG.BOE"), "wind_gust");
    }

    #[test]
    fn province_rename_passes_through_unknown() {
        assert_eq!(province_rename("XYZ"), "XYZ");
    }

    #[test]
    fn cest_and_cet_produce_distinct_utc_offsets() {
        let rome = chrono_tz::Europe::Rome;
        let summer = parse_province_datetime("2025-10-26T02:30:00CEST", rome).unwrap();
        let winter = parse_province_datetime("2025-10-26T02:30:00CET", rome).unwrap();
        // Fall-back: same local wall time, different UTC instants, one hour apart.
        assert_ne!(summer, winter);
        assert_eq!(winter - summer, Duration::hours(1));
    }

    #[test]
    fn split_dates_chunks_by_n_days() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let chunks = split_dates(start, end, 3, false);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (start, start + Duration::days(3)));
    }

    #[test]
    fn split_dates_splits_on_year_boundary() {
        let start = Utc.with_ymd_and_hms(2024, 12, 20, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let chunks = split_dates(start, end, 365, true);
        assert!(chunks[0].1.year() == 2024);
        assert!(chunks.last().unwrap().1.year() == 2025);
    }
}
