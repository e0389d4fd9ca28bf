// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-trace structural validation and span field coercion.
//!
//! Normalization either repairs a span in place or rejects the whole trace;
//! a trace that passed once passes again unchanged (idempotence), which the
//! worker pipeline relies on.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::model::{Span, Trace};

const MAX_NAME_LEN: usize = 100;
const MAX_SERVICE_LEN: usize = 100;
const MAX_RESOURCE_LEN: usize = 100;
const MAX_TYPE_LEN: usize = 100;

const DEFAULT_SERVICE_NAME: &str = "unnamed-service";
const DEFAULT_SPAN_NAME: &str = "unnamed_operation";

/// Nanoseconds since epoch on Jan 1, 2000. Starts before this point are
/// treated as unit bugs and reset.
const YEAR_2000_NANOSEC_TS: i64 = 946_684_800_000_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("empty trace")]
    EmptyTrace,
    #[error("trace ID is zero")]
    TraceIdZero,
    #[error("span ID is zero")]
    SpanIdZero,
    #[error("trace has foreign span (trace ID {0} != {1})")]
    ForeignSpan(u64, u64),
    #[error("duplicate span ID {0}")]
    DuplicateSpanId(u64),
}

/// Normalizes every span of a trace in place, or rejects the trace.
pub fn normalize_trace(trace: &mut Trace) -> Result<(), NormalizeError> {
    let Some(first) = trace.first() else {
        return Err(NormalizeError::EmptyTrace);
    };
    let trace_id = first.trace_id;

    for i in 0..trace.len() {
        if trace[i].trace_id != trace_id {
            return Err(NormalizeError::ForeignSpan(trace[i].trace_id, trace_id));
        }
        for j in 0..i {
            if trace[j].span_id == trace[i].span_id {
                return Err(NormalizeError::DuplicateSpanId(trace[i].span_id));
            }
        }
        normalize_span(&mut trace[i])?;
    }
    Ok(())
}

fn normalize_span(s: &mut Span) -> Result<(), NormalizeError> {
    if s.trace_id == 0 {
        return Err(NormalizeError::TraceIdZero);
    }
    if s.span_id == 0 {
        return Err(NormalizeError::SpanIdZero);
    }

    if s.service.is_empty() {
        debug!("fixing malformed trace, service is empty (reason:service_empty)");
        s.service = DEFAULT_SERVICE_NAME.to_string();
    } else if s.service.len() > MAX_SERVICE_LEN {
        debug!("fixing malformed trace, service is too long (reason:service_truncate)");
        truncate_utf8_with_ellipsis(&mut s.service, MAX_SERVICE_LEN);
    }

    if s.name.is_empty() {
        debug!("fixing malformed trace, name is empty (reason:span_name_empty)");
        s.name = DEFAULT_SPAN_NAME.to_string();
    } else if s.name.len() > MAX_NAME_LEN {
        debug!("fixing malformed trace, name is too long (reason:span_name_truncate)");
        truncate_utf8_with_ellipsis(&mut s.name, MAX_NAME_LEN);
    }

    if s.resource.is_empty() {
        debug!("fixing malformed trace, resource is empty (reason:resource_empty)");
        s.resource = s.name.clone();
    } else if s.resource.len() > MAX_RESOURCE_LEN {
        debug!("fixing malformed trace, resource is too long (reason:resource_truncate)");
        truncate_utf8_with_ellipsis(&mut s.resource, MAX_RESOURCE_LEN);
    }

    // ParentID, TraceID and SpanID set to the same value by some clients
    // denotes a root span.
    if s.parent_id == s.trace_id && s.parent_id == s.span_id {
        s.parent_id = 0;
    }

    if s.duration < 0 {
        debug!("fixing malformed trace, duration is negative (reason:invalid_duration)");
        s.duration = 0;
    }
    if s.duration > i64::MAX - s.start.max(0) {
        debug!("fixing malformed trace, duration overflows (reason:invalid_duration)");
        s.duration = 0;
    }
    if s.start < YEAR_2000_NANOSEC_TS {
        debug!("fixing malformed trace, start date is invalid (reason:invalid_start_date)");
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as i64);
        s.start = now - s.duration;
        if s.start < 0 {
            s.start = now;
        }
    }

    if s.r#type.is_empty() {
        s.r#type = "custom".to_string();
    } else if s.r#type.len() > MAX_TYPE_LEN {
        truncate_utf8(&mut s.r#type, MAX_TYPE_LEN);
    }

    if let Some(code) = s.meta.get("http.status_code") {
        if !is_valid_status_code(code) {
            debug!("fixing malformed trace, dropping invalid http.status_code={code}");
            s.meta.remove("http.status_code");
        }
    }
    Ok(())
}

fn is_valid_status_code(sc: &str) -> bool {
    sc.parse::<i64>().is_ok_and(|code| (100..600).contains(&code))
}

/// Truncates a string to at most `limit` bytes on a char boundary.
pub fn truncate_utf8(s: &mut String, limit: usize) {
    if s.len() <= limit {
        return;
    }
    let mut cut = limit;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Truncates to at most `limit` bytes, ellipsis included, so renormalizing
/// an already-truncated value is a no-op.
pub fn truncate_utf8_with_ellipsis(s: &mut String, limit: usize) {
    if s.len() <= limit {
        return;
    }
    truncate_utf8(s, limit.saturating_sub(3));
    s.push_str("...");
}
