//! Graceful degradation registry.
//!
//! Holds one fallback payload per logical service. Activation marks a service
//! as degraded; it never removes the strategy, so `resolve` keeps answering
//! after `deactivate`.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::config::ServiceConfig;

#[derive(Debug, Clone)]
struct Strategy {
    fallback: Value,
    active: bool,
}

/// Read-only view of one registered strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyInfo {
    pub service: String,
    pub active: bool,
    pub fallback: Value,
}

#[derive(Debug, Default)]
pub struct DegradationRegistry {
    strategies: DashMap<String, Strategy>,
}

impl DegradationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every service that carries a `fallback` in configuration.
    pub fn from_services(services: &[ServiceConfig]) -> Self {
        let registry = Self::new();
        for service in services {
            if let Some(fallback) = &service.fallback {
                registry.register_strategy(&service.name, fallback.clone());
            }
        }
        registry
    }

    /// Register (or replace) the fallback for `service`.
    ///
    /// Replacing keeps the current activation flag.
    pub fn register_strategy(&self, service: &str, fallback: Value) {
        self.strategies
            .entry(service.to_string())
            .and_modify(|s| s.fallback = fallback.clone())
            .or_insert(Strategy {
                fallback,
                active: false,
            });
        tracing::debug!(service = %service, "Degradation strategy registered");
    }

    /// Mark `service` degraded. Idempotent; returns false when no strategy exists.
    pub fn activate(&self, service: &str) -> bool {
        let Some(mut strategy) = self.strategies.get_mut(service) else {
            return false;
        };
        if !strategy.active {
            strategy.active = true;
            tracing::warn!(service = %service, "Graceful degradation activated");
        }
        true
    }

    /// Clear the degraded mark. The strategy stays registered.
    pub fn deactivate(&self, service: &str) -> bool {
        let Some(mut strategy) = self.strategies.get_mut(service) else {
            return false;
        };
        if strategy.active {
            strategy.active = false;
            tracing::info!(service = %service, "Graceful degradation deactivated");
        }
        true
    }

    pub fn is_active(&self, service: &str) -> bool {
        self.strategies.get(service).is_some_and(|s| s.active)
    }

    pub fn has_strategy(&self, service: &str) -> bool {
        self.strategies.contains_key(service)
    }

    /// The registered fallback merged with `overrides`, or `None` when the
    /// service has no strategy.
    ///
    /// When both values are JSON objects the top-level keys of `overrides`
    /// win; a non-object override replaces the fallback outright.
    pub fn resolve(&self, service: &str, overrides: Option<&Value>) -> Option<Value> {
        let fallback = self.strategies.get(service)?.fallback.clone();
        Some(match (fallback, overrides) {
            (fallback, None) => fallback,
            (Value::Object(mut base), Some(Value::Object(extra))) => {
                for (key, value) in extra {
                    base.insert(key.clone(), value.clone());
                }
                Value::Object(base)
            }
            (_, Some(other)) => other.clone(),
        })
    }

    pub fn strategies(&self) -> Vec<StrategyInfo> {
        let mut all: Vec<_> = self
            .strategies
            .iter()
            .map(|entry| StrategyInfo {
                service: entry.key().clone(),
                active: entry.active,
                fallback: entry.fallback.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn active_count(&self) -> usize {
        self.strategies.iter().filter(|s| s.active).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_survives_deactivate() {
        let registry = DegradationRegistry::new();
        let fb = json!({"items": [], "degraded": true});
        registry.register_strategy("courses", fb.clone());

        assert!(registry.activate("courses"));
        assert!(registry.is_active("courses"));
        assert_eq!(registry.resolve("courses", None), Some(fb.clone()));

        assert!(registry.deactivate("courses"));
        assert!(!registry.is_active("courses"));
        assert_eq!(registry.resolve("courses", None), Some(fb));
    }

    #[test]
    fn test_activate_is_idempotent() {
        let registry = DegradationRegistry::new();
        registry.register_strategy("jobs", json!({}));
        assert!(registry.activate("jobs"));
        assert!(registry.activate("jobs"));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_unknown_service_resolves_to_none() {
        let registry = DegradationRegistry::new();
        assert_eq!(registry.resolve("missing", None), None);
        assert!(!registry.activate("missing"));
        assert!(!registry.is_active("missing"));
    }

    #[test]
    fn test_override_keys_win() {
        let registry = DegradationRegistry::new();
        registry.register_strategy("payments", json!({"status": "queued", "retry": true}));

        let merged = registry
            .resolve("payments", Some(&json!({"status": "deferred", "id": 9})))
            .unwrap();
        assert_eq!(merged, json!({"status": "deferred", "retry": true, "id": 9}));
    }

    #[test]
    fn test_reregister_keeps_activation() {
        let registry = DegradationRegistry::new();
        registry.register_strategy("forum", json!(1));
        registry.activate("forum");
        registry.register_strategy("forum", json!(2));
        assert!(registry.is_active("forum"));
        assert_eq!(registry.resolve("forum", None), Some(json!(2)));
    }
}
