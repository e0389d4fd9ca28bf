// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling rates published back to client tracers.

use std::collections::HashMap;
use std::sync::RwLock;

/// Key under which the default rate is published to clients.
const DEFAULT_RATE_KEY: &str = "service:,env:";

/// Per-service sample rates shared between the priority sampler (writer)
/// and the receiver's v0.4 response path (readers). Readers hold the lock
/// only long enough to clone the map.
pub struct RateByService {
    rates: RwLock<HashMap<String, f64>>,
}

impl RateByService {
    pub fn new() -> RateByService {
        RateByService {
            rates: RwLock::new(HashMap::from([(DEFAULT_RATE_KEY.to_string(), 1.0)])),
        }
    }

    /// Publishes the rate for a `(service, env)` pair.
    pub fn set(&self, service: &str, env: &str, rate: f64) {
        let key = format!("service:{service},env:{env}");
        let mut rates = match self.rates.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rates.insert(key, rate.clamp(0.0, 1.0));
    }

    /// Snapshot of all published rates, as returned to v0.4 clients.
    pub fn get_all(&self) -> HashMap<String, f64> {
        match self.rates.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for RateByService {
    fn default() -> Self {
        RateByService::new()
    }
}

/// Configuration shared dynamically between agent components and clients.
pub struct DynamicConfig {
    pub rate_by_service: RateByService,
}

impl DynamicConfig {
    pub fn new() -> DynamicConfig {
        DynamicConfig {
            rate_by_service: RateByService::new(),
        }
    }
}

impl Default for DynamicConfig {
    fn default() -> Self {
        DynamicConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_always_present() {
        let rates = RateByService::new().get_all();
        assert_eq!(rates.get("service:,env:"), Some(&1.0));
    }

    #[test]
    fn test_set_and_get() {
        let rbs = RateByService::new();
        rbs.set("api", "prod", 0.25);
        rbs.set("api", "prod", 0.5);
        let all = rbs.get_all();
        assert_eq!(all.get("service:api,env:prod"), Some(&0.5));
    }

    #[test]
    fn test_rates_clamped() {
        let rbs = RateByService::new();
        rbs.set("api", "prod", 4.2);
        assert_eq!(rbs.get_all().get("service:api,env:prod"), Some(&1.0));
    }
}
