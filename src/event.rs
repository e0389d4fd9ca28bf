// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Analyzed-event extraction.
//!
//! Events are single spans sampled independently of the trace-level
//! decision. An ordered list of extractors produces per-span rates; the
//! first one with an opinion wins. Extracted events then pass a global
//! events-per-second cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rand::Rng;

use crate::config::Config;
use crate::model::{Span, ANALYZED_RATE_KEY};

/// One strategy for deciding whether a span is an analyzed event.
/// Returns `None` when the extractor has no opinion on the span.
pub trait Extractor: Send + Sync {
    fn extract(&self, span: &Span, priority: f64) -> Option<f64>;
}

/// Extracts spans carrying an explicit analyzed-span rate metric.
pub struct MetricBasedExtractor;

impl Extractor for MetricBasedExtractor {
    fn extract(&self, span: &Span, priority: f64) -> Option<f64> {
        let rate = span.metrics.get(ANALYZED_RATE_KEY).copied()?;
        // A client-kept trace forces extraction of its analyzed spans.
        if priority >= 2.0 && rate > 0.0 {
            return Some(1.0);
        }
        Some(rate)
    }
}

/// Extracts spans from a configured `(service, operation) -> rate` table.
pub struct FixedRateExtractor {
    rate_by_service_and_name: HashMap<String, HashMap<String, f64>>,
}

impl FixedRateExtractor {
    pub fn new(rates: HashMap<String, HashMap<String, f64>>) -> FixedRateExtractor {
        FixedRateExtractor {
            rate_by_service_and_name: rates,
        }
    }
}

impl Extractor for FixedRateExtractor {
    fn extract(&self, span: &Span, priority: f64) -> Option<f64> {
        let rate = self
            .rate_by_service_and_name
            .get(&span.service)?
            .get(&span.name.to_lowercase())
            .copied()?;
        if priority >= 2.0 && rate > 0.0 {
            return Some(1.0);
        }
        Some(rate)
    }
}

/// Extracts spans from the legacy `service -> rate` table. Only applies to
/// top level spans, which is all the legacy configuration ever addressed.
pub struct LegacyExtractor {
    rate_by_service: HashMap<String, f64>,
}

impl LegacyExtractor {
    pub fn new(rates: HashMap<String, f64>) -> LegacyExtractor {
        LegacyExtractor { rate_by_service: rates }
    }
}

impl Extractor for LegacyExtractor {
    fn extract(&self, span: &Span, _priority: f64) -> Option<f64> {
        if !span.is_top_level() {
            return None;
        }
        self.rate_by_service.get(&span.service).copied()
    }
}

/// Token bucket enforcing the global events-per-second cap.
struct TokenBucket {
    max_eps: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_eps: f64) -> TokenBucket {
        TokenBucket {
            max_eps,
            tokens: max_eps,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        if self.max_eps <= 0.0 {
            // A zero cap disables limiting.
            return true;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.max_eps).min(self.max_eps);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Runs the extractor chain over every span of a trace and applies the
/// EPS cap to what comes out.
pub struct Processor {
    extractors: Vec<Box<dyn Extractor>>,
    limiter: Mutex<TokenBucket>,
    events_dropped_eps: AtomicI64,
}

impl Processor {
    pub fn new(extractors: Vec<Box<dyn Extractor>>, max_eps: f64) -> Processor {
        Processor {
            extractors,
            limiter: Mutex::new(TokenBucket::new(max_eps)),
            events_dropped_eps: AtomicI64::new(0),
        }
    }

    /// Builds the extractor chain the way the configuration selects it:
    /// metric-based always first, then the fixed-rate table when present,
    /// else the legacy per-service table.
    pub fn from_config(config: &Config) -> Processor {
        let mut extractors: Vec<Box<dyn Extractor>> = vec![Box::new(MetricBasedExtractor)];
        if !config.analyzed_spans_by_service.is_empty() {
            extractors.push(Box::new(FixedRateExtractor::new(
                config.analyzed_spans_by_service.clone(),
            )));
        } else if !config.analyzed_rate_by_service.is_empty() {
            extractors.push(Box::new(LegacyExtractor::new(
                config.analyzed_rate_by_service.clone(),
            )));
        }
        Processor::new(extractors, config.max_eps)
    }

    /// Extracts analyzed events from a trace. Returns the surviving events
    /// and the number extracted before the EPS cap.
    pub fn process(&self, root: &Span, trace: &[Span]) -> (Vec<Span>, i64) {
        let priority = crate::sampler::get_sampling_priority(root).unwrap_or(0.0);
        let mut events = Vec::new();
        let mut extracted = 0;
        for span in trace {
            let Some(rate) = self
                .extractors
                .iter()
                .find_map(|e| e.extract(span, priority))
            else {
                continue;
            };
            if rate < 1.0 && rand::thread_rng().gen::<f64>() >= rate {
                continue;
            }
            extracted += 1;
            let allowed = {
                let mut limiter = match self.limiter.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                limiter.allow()
            };
            if !allowed {
                self.events_dropped_eps.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let mut event = span.clone();
            event.metrics.insert(ANALYZED_RATE_KEY.to_string(), rate);
            events.push(event);
        }
        (events, extracted)
    }

    /// Number of events dropped by the EPS cap since startup.
    pub fn events_dropped(&self) -> i64 {
        self.events_dropped_eps.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SAMPLING_PRIORITY_KEY, TOP_LEVEL_KEY};

    fn span(service: &str, name: &str) -> Span {
        Span {
            service: service.to_string(),
            name: name.to_string(),
            resource: "res".to_string(),
            trace_id: 1,
            span_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_metric_based_extraction() {
        let processor = Processor::new(vec![Box::new(MetricBasedExtractor)], 100.0);
        let mut s = span("api", "op");
        s.metrics.insert(ANALYZED_RATE_KEY.to_string(), 1.0);
        let root = s.clone();
        let (events, extracted) = processor.process(&root, &[s, span("api", "quiet")]);
        assert_eq!(extracted, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metrics[ANALYZED_RATE_KEY], 1.0);
    }

    #[test]
    fn test_priority_promotes_rate() {
        let extractor = MetricBasedExtractor;
        let mut s = span("api", "op");
        s.metrics.insert(ANALYZED_RATE_KEY.to_string(), 0.001);
        assert_eq!(extractor.extract(&s, 2.0), Some(1.0));
        assert_eq!(extractor.extract(&s, 1.0), Some(0.001));
    }

    #[test]
    fn test_fixed_rate_lookup_is_case_insensitive() {
        let rates = HashMap::from([(
            "api".to_string(),
            HashMap::from([("web.request".to_string(), 1.0)]),
        )]);
        let extractor = FixedRateExtractor::new(rates);
        assert_eq!(extractor.extract(&span("api", "Web.Request"), 0.0), Some(1.0));
        assert_eq!(extractor.extract(&span("api", "other"), 0.0), None);
        assert_eq!(extractor.extract(&span("db", "web.request"), 0.0), None);
    }

    #[test]
    fn test_legacy_extractor_top_level_only() {
        let extractor = LegacyExtractor::new(HashMap::from([("api".to_string(), 1.0)]));
        let mut top = span("api", "op");
        top.metrics.insert(TOP_LEVEL_KEY.to_string(), 1.0);
        assert_eq!(extractor.extract(&top, 0.0), Some(1.0));
        assert_eq!(extractor.extract(&span("api", "op"), 0.0), None);
    }

    #[test]
    fn test_first_extractor_wins() {
        let fixed = FixedRateExtractor::new(HashMap::from([(
            "api".to_string(),
            HashMap::from([("op".to_string(), 0.5)]),
        )]));
        let processor = Processor::new(
            vec![Box::new(MetricBasedExtractor), Box::new(fixed)],
            100.0,
        );
        let mut s = span("api", "op");
        s.metrics.insert(ANALYZED_RATE_KEY.to_string(), 1.0);
        let root = span("api", "root");
        let (events, _) = processor.process(&root, &[s]);
        // The metric-based verdict (rate 1.0) wins over the fixed 0.5.
        assert_eq!(events[0].metrics[ANALYZED_RATE_KEY], 1.0);
    }

    #[test]
    fn test_eps_cap_drops_overflow() {
        let processor = Processor::new(vec![Box::new(MetricBasedExtractor)], 2.0);
        let mut s = span("api", "op");
        s.metrics.insert(ANALYZED_RATE_KEY.to_string(), 1.0);
        let mut root = span("api", "root");
        root.metrics.insert(SAMPLING_PRIORITY_KEY.to_string(), 0.0);
        let trace: Vec<Span> = (0..10)
            .map(|i| {
                let mut sp = s.clone();
                sp.span_id = i + 1;
                sp
            })
            .collect();
        let (events, extracted) = processor.process(&root, &trace);
        assert_eq!(extracted, 10);
        // Burst capacity is max_eps tokens.
        assert_eq!(events.len(), 2);
        assert_eq!(processor.events_dropped(), 8);
    }
}
