// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Priority sampler: honors the client's sampling decision while keeping
//! per-`(service, env)` rate estimates that are published back to clients.

use std::sync::Arc;

use super::dynamic_config::DynamicConfig;
use super::score::{service_signature, ScoreEngine};
use crate::model::Span;
use crate::sampler::get_sampling_priority;

pub struct PrioritySampler {
    engine: Arc<ScoreEngine>,
    dynamic: Arc<DynamicConfig>,
}

impl PrioritySampler {
    pub fn new(target_tps: f64, extra_rate: f64, dynamic: Arc<DynamicConfig>) -> PrioritySampler {
        PrioritySampler {
            engine: Arc::new(ScoreEngine::new(target_tps, extra_rate)),
            dynamic,
        }
    }

    pub fn engine(&self) -> Arc<ScoreEngine> {
        Arc::clone(&self.engine)
    }

    /// Applies the client's decision: the trace is kept iff its priority is
    /// positive. The per-signature rate estimate is refreshed and published
    /// so clients converge on the target throughput.
    pub fn add(&self, env: &str, root: &Span) -> (bool, f64) {
        let rate = self.engine.observe(service_signature(env, root));
        self.dynamic.rate_by_service.set(&root.service, env, rate);
        let kept = get_sampling_priority(root).is_some_and(|p| p > 0.0);
        (kept, rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SAMPLING_PRIORITY_KEY;

    fn root(service: &str, priority: Option<f64>) -> Span {
        let mut span = Span {
            service: service.to_string(),
            name: "op".to_string(),
            resource: "res".to_string(),
            trace_id: 1,
            span_id: 1,
            ..Default::default()
        };
        if let Some(p) = priority {
            span.metrics.insert(SAMPLING_PRIORITY_KEY.to_string(), p);
        }
        span
    }

    #[test]
    fn test_keeps_positive_priority_only() {
        let sampler = PrioritySampler::new(10.0, 1.0, Arc::new(DynamicConfig::new()));
        assert!(sampler.add("prod", &root("api", Some(1.0))).0);
        assert!(sampler.add("prod", &root("api", Some(2.0))).0);
        assert!(!sampler.add("prod", &root("api", Some(0.0))).0);
        assert!(!sampler.add("prod", &root("api", Some(-1.0))).0);
        assert!(!sampler.add("prod", &root("api", None)).0);
    }

    #[test]
    fn test_publishes_rate_by_service() {
        let dynamic = Arc::new(DynamicConfig::new());
        let sampler = PrioritySampler::new(10.0, 1.0, Arc::clone(&dynamic));
        sampler.add("prod", &root("api", Some(1.0)));
        let rates = dynamic.rate_by_service.get_all();
        assert!(rates.contains_key("service:api,env:prod"));
    }

    #[test]
    fn test_rate_tracks_traffic() {
        let dynamic = Arc::new(DynamicConfig::new());
        let sampler = PrioritySampler::new(10.0, 1.0, Arc::clone(&dynamic));
        let span = root("api", Some(1.0));
        for _ in 0..1000 {
            sampler.add("prod", &span);
        }
        sampler.engine().decay();
        sampler.add("prod", &span);
        let rates = dynamic.rate_by_service.get_all();
        let rate = rates.get("service:api,env:prod").copied().expect("rate");
        assert!(rate < 1.0, "published rate was {rate}");
    }
}
