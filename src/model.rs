// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span and trace data model shared by every pipeline stage.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Metric key carrying the sampling priority set by the client on the root.
pub const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";
/// Metric key holding the global (effective) sample rate of a trace.
pub const SAMPLE_RATE_GLOBAL_KEY: &str = "_sample_rate";
/// Metric key holding the rate applied by the client tracer.
pub const SAMPLE_RATE_CLIENT_KEY: &str = "_dd1.sr.rcusr";
/// Metric key holding the admission pre-sample rate.
pub const SAMPLE_RATE_PRESAMPLER_KEY: &str = "_dd1.sr.rapre";
/// Metric key holding the analyzed-span extraction rate.
pub const ANALYZED_RATE_KEY: &str = "_dd1.sr.eausr";
/// Metric the agent sets to mark a top level span.
pub const TOP_LEVEL_KEY: &str = "_top_level";
/// Metric a tracer sets to force trace metrics on a span.
pub const MEASURED_KEY: &str = "_dd.measured";

/// A single unit of work reported by a tracer.
///
/// Identity is `(trace_id, span_id)`; `start` and `duration` are in
/// nanoseconds. All fields default so sparse client payloads decode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub trace_id: u64,
    #[serde(default)]
    pub span_id: u64,
    #[serde(default)]
    pub parent_id: u64,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default, rename = "type")]
    pub r#type: String,
}

impl Span {
    /// Returns true if the agent marked this span top level.
    pub fn is_top_level(&self) -> bool {
        self.metrics.get(TOP_LEVEL_KEY).is_some_and(|v| *v == 1.0)
    }

    /// Returns true if a tracer requested trace metrics for this span.
    pub fn is_measured(&self) -> bool {
        self.metrics.get(MEASURED_KEY).is_some_and(|v| *v == 1.0)
    }
}

/// An unordered collection of spans sharing a trace ID.
pub type Trace = Vec<Span>;

/// A payload of several traces, as decoded from one request body.
pub type Traces = Vec<Trace>;

/// Returns the index of the root span of a trace.
///
/// The root is the span whose parent is zero or not present in the trace,
/// ties broken by smallest start. Falls back to the last span so the choice
/// is total for any non-empty trace.
pub fn root_index(trace: &[Span]) -> usize {
    let ids: HashSet<u64> = trace.iter().map(|s| s.span_id).collect();
    let mut root: Option<usize> = None;
    for (i, span) in trace.iter().enumerate() {
        if span.parent_id != 0 && ids.contains(&span.parent_id) {
            continue;
        }
        root = match root {
            Some(r) if trace[r].start <= span.start => Some(r),
            _ => Some(i),
        };
    }
    root.unwrap_or(trace.len().saturating_sub(1))
}

/// Returns the first user-defined `env` found in the trace's span meta.
pub fn trace_env(trace: &[Span]) -> Option<&str> {
    trace
        .iter()
        .find_map(|s| s.meta.get("env").map(String::as_str))
        .filter(|e| !e.is_empty())
}

/// Returns true if any span of the trace carries an error.
pub fn trace_contains_error(trace: &[Span]) -> bool {
    trace.iter().any(|s| s.error != 0)
}

/// A span copy annotated with its statistical weight.
///
/// The weight is the inverse of the client sample rate so that stats
/// computed over sampled traffic still estimate the real volume.
#[derive(Clone, Debug)]
pub struct WeightedSpan {
    pub span: Span,
    pub weight: f64,
    pub top_level: bool,
    pub measured: bool,
}

/// One weighted entry per span of a processed trace, input to the
/// concentrator. Entry order matches the source trace.
pub type WeightedTrace = Vec<WeightedSpan>;

/// Builds the weighted view of a trace. The weight is derived from the
/// root's client sample rate and shared by every span of the trace.
pub fn weighted_trace(trace: &[Span], root_idx: usize) -> WeightedTrace {
    let weight = trace
        .get(root_idx)
        .and_then(|r| r.metrics.get(SAMPLE_RATE_CLIENT_KEY))
        .copied()
        .filter(|rate| *rate > 0.0 && *rate <= 1.0)
        .map_or(1.0, |rate| 1.0 / rate);
    trace
        .iter()
        .map(|s| WeightedSpan {
            weight,
            top_level: s.is_top_level(),
            measured: s.is_measured(),
            span: s.clone(),
        })
        .collect()
}
