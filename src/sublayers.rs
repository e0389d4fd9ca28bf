// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Top-level span marks, top-level subtrace extraction and sublayer
//! metric computation.
//!
//! All derived metrics are written into span `metrics` maps here, in the
//! worker, before the payload is handed to the samplers and the
//! concentrator; no other stage mutates spans afterwards.

use std::collections::HashMap;

use crate::model::{Span, TOP_LEVEL_KEY};

/// Sublayer duration grouped by service.
pub const SUBLAYER_DURATION_BY_SERVICE: &str = "_sublayers.duration.by_service";
/// Sublayer duration grouped by span type.
pub const SUBLAYER_DURATION_BY_TYPE: &str = "_sublayers.duration.by_type";
/// Number of spans in the subtrace.
pub const SUBLAYER_SPAN_COUNT: &str = "_sublayers.span_count";

/// A single computed sublayer metric, optionally tagged.
#[derive(Clone, Debug, PartialEq)]
pub struct SublayerValue {
    pub metric: String,
    pub tag: Option<(String, String)>,
    pub value: f64,
}

/// Marks the top level spans of a trace with the `_top_level` metric.
///
/// A span is top level when it has no parent in the trace or its parent
/// belongs to another service (a "local root" of that service's subtree).
pub fn compute_top_level(trace: &mut [Span]) {
    let mut index: HashMap<u64, usize> = HashMap::with_capacity(trace.len());
    for (i, span) in trace.iter().enumerate() {
        index.insert(span.span_id, i);
    }
    for i in 0..trace.len() {
        let parent_id = trace[i].parent_id;
        let top_level = if parent_id == 0 {
            true
        } else {
            match index.get(&parent_id) {
                Some(p) => trace[*p].service != trace[i].service,
                None => true,
            }
        };
        if top_level {
            trace[i].metrics.insert(TOP_LEVEL_KEY.to_string(), 1.0);
        } else {
            trace[i].metrics.remove(TOP_LEVEL_KEY);
        }
    }
}

/// A sub-DAG rooted at a top-level span, expressed as indices into the
/// original trace. Identity by index avoids back-pointers into the span
/// array.
#[derive(Debug, PartialEq, Eq)]
pub struct Subtrace {
    pub root: usize,
    pub spans: Vec<usize>,
}

/// Extracts the subtrace under each top-level span, descending until the
/// next top-level boundary. Since service changes are exactly what makes a
/// span top level, each subtrace stays within its sub-root's service.
///
/// Call after [`compute_top_level`].
pub fn extract_top_level_subtraces(trace: &[Span]) -> Vec<Subtrace> {
    let mut children: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, span) in trace.iter().enumerate() {
        children.entry(span.parent_id).or_default().push(i);
    }
    let mut subtraces = Vec::new();
    for (root, span) in trace.iter().enumerate() {
        if !span.is_top_level() {
            continue;
        }
        let mut spans = vec![root];
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            let Some(kids) = children.get(&trace[i].span_id) else {
                continue;
            };
            for &kid in kids {
                if trace[kid].is_top_level() {
                    continue;
                }
                spans.push(kid);
                stack.push(kid);
            }
        }
        subtraces.push(Subtrace { root, spans });
    }
    subtraces
}

#[derive(Clone, Copy)]
enum EventKind {
    Open,
    Close,
}

/// Computes the sublayer metrics of one subtrace: exclusive durations by
/// service and by span type, plus the span count.
///
/// The duration of each elementary time interval is split evenly among the
/// spans active during it; a span is active while it is open and none of
/// its children are.
pub fn compute_sublayers(trace: &[Span], indices: &[usize]) -> Vec<SublayerValue> {
    if indices.is_empty() {
        return Vec::new();
    }

    // Local positions within the subtrace.
    let mut position: HashMap<u64, usize> = HashMap::with_capacity(indices.len());
    for (pos, &i) in indices.iter().enumerate() {
        position.insert(trace[i].span_id, pos);
    }
    let parent_of: Vec<Option<usize>> = indices
        .iter()
        .map(|&i| position.get(&trace[i].parent_id).copied())
        .collect();

    let mut events: Vec<(i64, EventKind, usize)> = Vec::with_capacity(indices.len() * 2);
    for (pos, &i) in indices.iter().enumerate() {
        let span = &trace[i];
        events.push((span.start, EventKind::Open, pos));
        events.push((span.start.saturating_add(span.duration), EventKind::Close, pos));
    }
    events.sort_by_key(|(ts, _, _)| *ts);

    let mut open = vec![false; indices.len()];
    let mut open_children = vec![0usize; indices.len()];
    let mut duration_by_service: HashMap<String, f64> = HashMap::new();
    let mut duration_by_type: HashMap<String, f64> = HashMap::new();

    let mut cursor = 0usize;
    let mut prev_ts = events.first().map_or(0, |(ts, _, _)| *ts);
    while cursor < events.len() {
        let ts = events[cursor].0;
        let dt = (ts - prev_ts) as f64;
        if dt > 0.0 {
            let active: Vec<usize> = (0..indices.len())
                .filter(|&pos| open[pos] && open_children[pos] == 0)
                .collect();
            if !active.is_empty() {
                let share = dt / active.len() as f64;
                for pos in active {
                    let span = &trace[indices[pos]];
                    *duration_by_service
                        .entry(span.service.clone())
                        .or_insert(0.0) += share;
                    *duration_by_type.entry(span.r#type.clone()).or_insert(0.0) += share;
                }
            }
        }
        // Apply every event at this timestamp before attributing further.
        while cursor < events.len() && events[cursor].0 == ts {
            let (_, kind, pos) = events[cursor];
            match kind {
                EventKind::Open => {
                    open[pos] = true;
                    if let Some(parent) = parent_of[pos] {
                        open_children[parent] += 1;
                    }
                }
                EventKind::Close => {
                    open[pos] = false;
                    if let Some(parent) = parent_of[pos] {
                        open_children[parent] = open_children[parent].saturating_sub(1);
                    }
                }
            }
            cursor += 1;
        }
        prev_ts = ts;
    }

    let mut values = Vec::with_capacity(duration_by_service.len() + duration_by_type.len() + 1);
    let mut by_service: Vec<(String, f64)> = duration_by_service.into_iter().collect();
    by_service.sort_by(|a, b| a.0.cmp(&b.0));
    for (service, value) in by_service {
        values.push(SublayerValue {
            metric: SUBLAYER_DURATION_BY_SERVICE.to_string(),
            tag: Some(("sublayer_service".to_string(), service)),
            value,
        });
    }
    let mut by_type: Vec<(String, f64)> = duration_by_type.into_iter().collect();
    by_type.sort_by(|a, b| a.0.cmp(&b.0));
    for (span_type, value) in by_type {
        values.push(SublayerValue {
            metric: SUBLAYER_DURATION_BY_TYPE.to_string(),
            tag: Some(("sublayer_type".to_string(), span_type)),
            value,
        });
    }
    values.push(SublayerValue {
        metric: SUBLAYER_SPAN_COUNT.to_string(),
        tag: None,
        value: indices.len() as f64,
    });
    values
}

/// Attaches sublayer values to a span's metrics map, tag folded into the
/// key, e.g. `_sublayers.duration.by_service.sublayer_service:api`.
pub fn set_sublayers_on_span(span: &mut Span, values: &[SublayerValue]) {
    for v in values {
        let key = match &v.tag {
            Some((tag_name, tag_value)) => format!("{}.{}:{}", v.metric, tag_name, tag_value),
            None => v.metric.clone(),
        };
        span.metrics.insert(key, v.value);
    }
}
