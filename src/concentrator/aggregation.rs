// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of weighted spans into stats groups within a time bucket.

use std::collections::HashMap;

use serde::Serialize;
use sketches_ddsketch::{Config as SketchConfig, DDSketch};

use crate::model::{Span, WeightedSpan};
use crate::sublayers::SublayerValue;

const TAG_STATUS_CODE: &str = "http.status_code";
const TAG_ORIGIN: &str = "_dd.origin";
const TAG_SYNTHETICS: &str = "synthetics";

/// Key grouping spans with the same aggregation coordinates.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Default)]
pub(crate) struct AggregationKey {
    pub env: String,
    pub service: String,
    pub name: String,
    pub resource: String,
    pub span_type: String,
    pub http_status_code: u32,
    pub synthetics: bool,
    pub top_level: bool,
}

impl AggregationKey {
    pub(crate) fn from_span(env: &str, ws: &WeightedSpan) -> AggregationKey {
        AggregationKey {
            env: env.to_string(),
            service: ws.span.service.clone(),
            name: ws.span.name.clone(),
            resource: ws.span.resource.clone(),
            span_type: ws.span.r#type.clone(),
            http_status_code: status_code(&ws.span),
            synthetics: ws
                .span
                .meta
                .get(TAG_ORIGIN)
                .is_some_and(|origin| origin.starts_with(TAG_SYNTHETICS)),
            top_level: ws.top_level,
        }
    }
}

/// Key grouping sublayer rollups: one value per sub-root service, metric
/// and tag within a bucket.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub(crate) struct SublayerKey {
    pub env: String,
    pub service: String,
    pub metric: String,
    pub tag: Option<(String, String)>,
}

fn status_code(span: &Span) -> u32 {
    if let Some(code) = span.metrics.get(TAG_STATUS_CODE) {
        *code as u32
    } else if let Some(code) = span.meta.get(TAG_STATUS_CODE) {
        code.parse().unwrap_or(0)
    } else {
        0
    }
}

/// Stats accumulated for one aggregation key.
pub(crate) struct GroupedStats {
    hits: f64,
    top_level_hits: f64,
    errors: f64,
    duration: f64,
    ok_summary: DDSketch,
    error_summary: DDSketch,
}

impl std::fmt::Debug for GroupedStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupedStats")
            .field("hits", &self.hits)
            .field("top_level_hits", &self.top_level_hits)
            .field("errors", &self.errors)
            .field("duration", &self.duration)
            .finish()
    }
}

impl Default for GroupedStats {
    fn default() -> Self {
        GroupedStats {
            hits: 0.0,
            top_level_hits: 0.0,
            errors: 0.0,
            duration: 0.0,
            ok_summary: DDSketch::new(SketchConfig::defaults()),
            error_summary: DDSketch::new(SketchConfig::defaults()),
        }
    }
}

impl GroupedStats {
    fn insert(&mut self, ws: &WeightedSpan) {
        self.hits += ws.weight;
        self.duration += ws.weight * ws.span.duration as f64;
        if ws.top_level {
            self.top_level_hits += ws.weight;
        }
        if ws.span.error != 0 {
            self.errors += ws.weight;
            self.error_summary.add(ws.span.duration as f64);
        } else {
            self.ok_summary.add(ws.span.duration as f64);
        }
    }
}

/// One time-aligned aggregation window.
#[derive(Debug, Default)]
pub(crate) struct StatsBucket {
    start: i64,
    data: HashMap<AggregationKey, GroupedStats>,
    sublayers: HashMap<SublayerKey, f64>,
}

impl StatsBucket {
    pub(crate) fn new(start: i64) -> StatsBucket {
        StatsBucket {
            start,
            ..Default::default()
        }
    }

    pub(crate) fn insert(&mut self, env: &str, ws: &WeightedSpan) {
        self.data
            .entry(AggregationKey::from_span(env, ws))
            .or_default()
            .insert(ws);
    }

    pub(crate) fn insert_sublayers(&mut self, env: &str, ws: &WeightedSpan, values: &[SublayerValue]) {
        for v in values {
            let key = SublayerKey {
                env: env.to_string(),
                service: ws.span.service.clone(),
                metric: v.metric.clone(),
                tag: v.tag.clone(),
            };
            *self.sublayers.entry(key).or_insert(0.0) += ws.weight * v.value;
        }
    }

    pub(crate) fn flush(self, bucket_duration: i64) -> StatsBucketPayload {
        StatsBucketPayload {
            start: self.start,
            duration: bucket_duration,
            stats: self
                .data
                .into_iter()
                .map(|(key, group)| GroupedStatsPayload {
                    env: key.env,
                    service: key.service,
                    name: key.name,
                    resource: key.resource,
                    r#type: key.span_type,
                    http_status_code: key.http_status_code,
                    synthetics: key.synthetics,
                    top_level: key.top_level,
                    hits: group.hits,
                    top_level_hits: group.top_level_hits,
                    errors: group.errors,
                    duration: group.duration,
                    ok_summary: DistributionSummary::from_sketch(&group.ok_summary),
                    error_summary: DistributionSummary::from_sketch(&group.error_summary),
                })
                .collect(),
            sublayers: self
                .sublayers
                .into_iter()
                .map(|(key, value)| SublayerStatPayload {
                    env: key.env,
                    service: key.service,
                    metric: key.metric,
                    tag: key
                        .tag
                        .map(|(name, val)| format!("{name}:{val}"))
                        .unwrap_or_default(),
                    value,
                })
                .collect(),
        }
    }
}

/// A duration distribution condensed into the percentiles the backend
/// consumes.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct DistributionSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl DistributionSummary {
    fn from_sketch(sketch: &DDSketch) -> DistributionSummary {
        let quantile = |q: f64| sketch.quantile(q).ok().flatten().unwrap_or(0.0);
        DistributionSummary {
            count: sketch.count() as u64,
            min: sketch.min().unwrap_or(0.0),
            max: sketch.max().unwrap_or(0.0),
            p50: quantile(0.5),
            p75: quantile(0.75),
            p90: quantile(0.9),
            p95: quantile(0.95),
            p99: quantile(0.99),
        }
    }
}

/// Serialized form of one flushed stats group.
#[derive(Clone, Debug, Serialize)]
pub struct GroupedStatsPayload {
    pub env: String,
    pub service: String,
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub http_status_code: u32,
    pub synthetics: bool,
    pub top_level: bool,
    pub hits: f64,
    pub top_level_hits: f64,
    pub errors: f64,
    pub duration: f64,
    pub ok_summary: DistributionSummary,
    pub error_summary: DistributionSummary,
}

/// Serialized form of one sublayer rollup.
#[derive(Clone, Debug, Serialize)]
pub struct SublayerStatPayload {
    pub env: String,
    pub service: String,
    pub metric: String,
    pub tag: String,
    pub value: f64,
}

/// Serialized form of one flushed bucket.
#[derive(Clone, Debug, Serialize)]
pub struct StatsBucketPayload {
    pub start: i64,
    pub duration: i64,
    pub stats: Vec<GroupedStatsPayload>,
    pub sublayers: Vec<SublayerStatPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(service: &str, duration: i64, error: i32, weight: f64) -> WeightedSpan {
        WeightedSpan {
            span: Span {
                service: service.to_string(),
                name: "op".to_string(),
                resource: "res".to_string(),
                trace_id: 1,
                span_id: 1,
                duration,
                error,
                r#type: "web".to_string(),
                ..Default::default()
            },
            weight,
            top_level: true,
            measured: false,
        }
    }

    #[test]
    fn test_weighted_accumulation() {
        let mut bucket = StatsBucket::new(0);
        bucket.insert("prod", &weighted("api", 100, 0, 2.0));
        bucket.insert("prod", &weighted("api", 50, 1, 1.0));
        let payload = bucket.flush(10);
        assert_eq!(payload.stats.len(), 1);
        let group = &payload.stats[0];
        assert!((group.hits - 3.0).abs() < 1e-9);
        assert!((group.errors - 1.0).abs() < 1e-9);
        assert!((group.duration - 250.0).abs() < 1e-9);
        assert_eq!(group.ok_summary.count, 1);
        assert_eq!(group.error_summary.count, 1);
    }

    #[test]
    fn test_aggregation_key_splits_status_code() {
        let mut bucket = StatsBucket::new(0);
        let mut ok = weighted("api", 10, 0, 1.0);
        ok.span
            .meta
            .insert("http.status_code".to_string(), "200".to_string());
        let mut teapot = weighted("api", 10, 0, 1.0);
        teapot
            .span
            .metrics
            .insert("http.status_code".to_string(), 418.0);
        bucket.insert("prod", &ok);
        bucket.insert("prod", &teapot);
        let payload = bucket.flush(10);
        assert_eq!(payload.stats.len(), 2);
    }

    #[test]
    fn test_synthetics_detected_from_origin() {
        let mut ws = weighted("api", 10, 0, 1.0);
        ws.span
            .meta
            .insert("_dd.origin".to_string(), "synthetics-browser".to_string());
        assert!(AggregationKey::from_span("prod", &ws).synthetics);
    }

    #[test]
    fn test_sublayer_rollup_weighted() {
        let mut bucket = StatsBucket::new(0);
        let ws = weighted("api", 10, 0, 2.0);
        bucket.insert_sublayers(
            "prod",
            &ws,
            &[SublayerValue {
                metric: "_sublayers.duration.by_service".to_string(),
                tag: Some(("sublayer_service".to_string(), "db".to_string())),
                value: 30.0,
            }],
        );
        let payload = bucket.flush(10);
        assert_eq!(payload.sublayers.len(), 1);
        let sub = &payload.sublayers[0];
        assert_eq!(sub.tag, "sublayer_service:db");
        assert!((sub.value - 60.0).abs() < 1e-9);
    }
}
