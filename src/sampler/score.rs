// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Score-based sampling over a sliding traffic estimate.
//!
//! Each sampler observes a signature per trace and keeps an EWMA of how
//! many times per second that signature is seen. The sample rate is
//! `min(1, target_tps / seen_tps)`, so rare signatures are always kept and
//! heavy ones are thinned down to the target throughput.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::model::Span;

/// Fraction of the previous estimate kept at each one-second refresh.
const EWMA_KEEP: f64 = 0.9;
/// Signatures whose estimate drops below this are forgotten.
const MIN_TPS: f64 = 1e-4;

/// A stable key describing the shape of a trace for rate estimation.
pub type Signature = u64;

/// Signature used by the score and errors samplers: the root's service,
/// operation, resource and error flag, plus the trace env.
pub fn trace_signature(env: &str, root: &Span) -> Signature {
    let mut hasher = DefaultHasher::new();
    env.hash(&mut hasher);
    root.service.hash(&mut hasher);
    root.name.hash(&mut hasher);
    root.resource.hash(&mut hasher);
    (root.error != 0).hash(&mut hasher);
    hasher.finish()
}

/// Signature used by the priority sampler: service and env only.
pub fn service_signature(env: &str, root: &Span) -> Signature {
    let mut hasher = DefaultHasher::new();
    env.hash(&mut hasher);
    root.service.hash(&mut hasher);
    hasher.finish()
}

#[derive(Default, Clone, Copy)]
struct SignatureStats {
    /// EWMA of observations per second.
    tps: f64,
    /// Observations since the last refresh.
    count: f64,
}

/// Per-signature traffic estimator shared by the samplers.
pub struct ScoreEngine {
    target_tps: f64,
    extra_rate: f64,
    backend: Mutex<HashMap<Signature, SignatureStats>>,
}

impl ScoreEngine {
    pub fn new(target_tps: f64, extra_rate: f64) -> ScoreEngine {
        ScoreEngine {
            target_tps,
            extra_rate: extra_rate.clamp(0.0, 1.0),
            backend: Mutex::new(HashMap::new()),
        }
    }

    /// Records one observation of a signature and returns the sample rate
    /// currently applying to it.
    pub fn observe(&self, sig: Signature) -> f64 {
        let mut backend = match self.backend.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stats = backend.entry(sig).or_default();
        stats.count += 1.0;
        self.rate_for(stats)
    }

    fn rate_for(&self, stats: &SignatureStats) -> f64 {
        if stats.tps <= MIN_TPS {
            return 1.0;
        }
        (self.target_tps / stats.tps).min(1.0) * self.extra_rate
    }

    /// Folds the counts of the last second into the per-signature EWMA and
    /// drops signatures that went quiet.
    pub fn decay(&self) {
        let mut backend = match self.backend.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backend.retain(|_, stats| {
            stats.tps = EWMA_KEEP * stats.tps + (1.0 - EWMA_KEEP) * stats.count;
            stats.count = 0.0;
            stats.tps > MIN_TPS
        });
    }

    /// Runs the one-second refresh loop until cancellation.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => self.decay(),
                () = shutdown.cancelled() => return,
            }
        }
    }
}

/// A sampler keeping traces with probability `min(1, target_tps/seen_tps)`
/// per signature. Also used, with its own target, as the errors sampler.
pub struct ScoreSampler {
    engine: Arc<ScoreEngine>,
}

impl ScoreSampler {
    pub fn new(target_tps: f64, extra_rate: f64) -> ScoreSampler {
        ScoreSampler {
            engine: Arc::new(ScoreEngine::new(target_tps, extra_rate)),
        }
    }

    pub fn engine(&self) -> Arc<ScoreEngine> {
        Arc::clone(&self.engine)
    }

    /// Observes the trace and decides whether to keep it. Returns the keep
    /// decision and the rate that was applied.
    pub fn add(&self, env: &str, root: &Span) -> (bool, f64) {
        let rate = self.engine.observe(trace_signature(env, root));
        let kept = rate >= 1.0 || rand::thread_rng().gen::<f64>() < rate;
        (kept, rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(service: &str, resource: &str, error: i32) -> Span {
        Span {
            service: service.to_string(),
            name: "op".to_string(),
            resource: resource.to_string(),
            trace_id: 1,
            span_id: 1,
            error,
            ..Default::default()
        }
    }

    #[test]
    fn test_unseen_signature_kept() {
        let sampler = ScoreSampler::new(10.0, 1.0);
        let (kept, rate) = sampler.add("prod", &root("api", "/x", 0));
        assert!(kept);
        assert!((rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_drops_for_heavy_signature() {
        let engine = ScoreEngine::new(10.0, 1.0);
        let sig = trace_signature("prod", &root("api", "/x", 0));
        for _ in 0..1000 {
            engine.observe(sig);
        }
        engine.decay();
        // EWMA moved towards 1000/s: rate must now be well below 1.
        let rate = engine.observe(sig);
        assert!(rate < 1.0, "rate was {rate}");
    }

    #[test]
    fn test_signatures_are_independent() {
        let engine = ScoreEngine::new(10.0, 1.0);
        let heavy = trace_signature("prod", &root("api", "/hot", 0));
        for _ in 0..1000 {
            engine.observe(heavy);
        }
        engine.decay();
        let cold = trace_signature("prod", &root("api", "/cold", 0));
        assert!((engine.observe(cold) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_flag_changes_signature() {
        let ok = trace_signature("prod", &root("api", "/x", 0));
        let err = trace_signature("prod", &root("api", "/x", 1));
        assert_ne!(ok, err);
        assert_eq!(ok, trace_signature("prod", &root("api", "/x", 0)));
    }

    #[test]
    fn test_quiet_signatures_forgotten() {
        let engine = ScoreEngine::new(10.0, 1.0);
        let sig = trace_signature("prod", &root("api", "/x", 0));
        engine.observe(sig);
        for _ in 0..200 {
            engine.decay();
        }
        let backend = engine.backend.lock().expect("lock");
        assert!(backend.is_empty());
    }

    #[test]
    fn test_extra_rate_scales_down() {
        let engine = ScoreEngine::new(10.0, 0.5);
        let sig = trace_signature("prod", &root("api", "/x", 0));
        for _ in 0..100 {
            engine.observe(sig);
        }
        engine.decay();
        let stats = {
            let backend = engine.backend.lock().expect("lock");
            *backend.get(&sig).expect("stats")
        };
        let expected = (10.0 / stats.tps).min(1.0) * 0.5;
        assert!((engine.observe(sig) - expected).abs() < 1e-9);
    }
}
