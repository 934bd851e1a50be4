//! Provider Registry (spec §4.6): a process-wide, read-only lookup from
//! provider name to its adapter instance.
//!
//! Grounded on `original_source/webhandler/provider_manager.py::ProviderManager`,
//! minus its `importlib`/`pkgutil` dynamic plugin discovery -- Rust has no
//! reflection-based module scanning, so adapters are registered explicitly
//! at startup instead of being discovered from a package directory.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MeteoError, MeteoResult};

use super::ProviderAdapter;

/// Immutable once built. Lookup is case-insensitive on the provider name,
/// matching `ProviderManager.get_provider`'s `.lower()` normalization.
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder {
            adapters: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> MeteoResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| MeteoError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ProviderAdapter>)> {
        self.adapters.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Builds a [`ProviderRegistry`] at startup. There is deliberately no way to
/// register an adapter after the registry is built (spec §4.6: "built once,
/// read-only thereafter").
pub struct ProviderRegistryBuilder {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistryBuilder {
    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let key = adapter.name().to_lowercase();
        self.adapters.insert(key, adapter);
        self
    }

    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            adapters: self.adapters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frequency::Inclusive;
    use crate::provider::{AdapterState, FetchRequest, RateLimit};
    use crate::record::{Frame, StationInfo};
    use async_trait::async_trait;
    use chrono::Duration;

    struct NamedStub {
        name: String,
        state: AdapterState,
    }

    #[async_trait]
    impl ProviderAdapter for NamedStub {
        fn name(&self) -> &str {
            &self.name
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

    fn stub(name: &str) -> Arc<dyn ProviderAdapter> {
        Arc::new(NamedStub {
            name: name.to_string(),
            state: AdapterState::new(&RateLimit::default()),
        })
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = ProviderRegistry::builder().register(stub("Province")).build();
        assert!(registry.get("province").is_ok());
        assert!(registry.get("PROVINCE").is_ok());
        assert!(registry.get("PrOvInCe").is_ok());
    }

    #[test]
    fn unknown_provider_errors() {
        let registry = ProviderRegistry::builder().register(stub("province")).build();
        assert!(matches!(registry.get("open_meteo"), Err(MeteoError::UnknownProvider(_))));
    }

    #[test]
    fn names_lists_registered_providers_sorted() {
        let registry = ProviderRegistry::builder()
            .register(stub("province"))
            .register(stub("open_meteo"))
            .build();
        assert_eq!(registry.names(), vec!["open_meteo".to_string(), "province".to_string()]);
    }
}
