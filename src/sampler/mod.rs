// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace samplers and the rate bookkeeping they share.
//!
//! Three samplers run independently (priority, score, errors-score); the
//! worker OR-combines their keep decisions and merges their rates into the
//! root span's global sample rate.

pub mod dynamic_config;
pub mod priority;
pub mod score;

use crate::model::{
    Span, SAMPLE_RATE_CLIENT_KEY, SAMPLE_RATE_GLOBAL_KEY, SAMPLE_RATE_PRESAMPLER_KEY,
    SAMPLING_PRIORITY_KEY,
};

/// Reads the sampling priority a client set on the root span.
pub fn get_sampling_priority(root: &Span) -> Option<f64> {
    root.metrics.get(SAMPLING_PRIORITY_KEY).copied()
}

/// Reads the global sample rate of a trace, defaulting to 1.
pub fn get_global_rate(root: &Span) -> f64 {
    root.metrics
        .get(SAMPLE_RATE_GLOBAL_KEY)
        .copied()
        .filter(|r| (0.0..=1.0).contains(r))
        .unwrap_or(1.0)
}

/// Merges a rate into the root's global sample rate, multiplicatively.
pub fn add_global_rate(root: &mut Span, rate: f64) {
    let combined = get_global_rate(root) * rate.clamp(0.0, 1.0);
    root.metrics
        .insert(SAMPLE_RATE_GLOBAL_KEY.to_string(), combined);
}

/// Records the rate applied by the client tracer on the root.
pub fn set_client_rate(root: &mut Span, rate: f64) {
    root.metrics.insert(SAMPLE_RATE_CLIENT_KEY.to_string(), rate);
}

/// Records the admission pre-sample rate on the root.
pub fn set_pre_sample_rate(root: &mut Span, rate: f64) {
    root.metrics
        .insert(SAMPLE_RATE_PRESAMPLER_KEY.to_string(), rate);
}

/// Combines the rates of two samplers that may both keep the same trace.
///
/// `a + b - a*b` is the probability that at least one of two independent
/// decisions kept it; a rate of zero means the sampler was not consulted.
pub fn combine_rates(a: f64, b: f64) -> f64 {
    if a >= 1.0 || b >= 1.0 {
        return 1.0;
    }
    a + b - a * b
}
