// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP receiver: version-dispatched trace intake.
//!
//! Each endpoint is bound to a wire-format version; the decoder and the
//! reply formatter switch on it. Payloads pass the admission rate limiter
//! before being decoded, and decoded traces are normalized and enqueued
//! asynchronously so the client gets its reply as soon as the payload is
//! parsed. The enqueue blocks when the pipeline is saturated, which is the
//! backpressure that bounds decode throughput.

pub mod listener;
pub mod rate_limiter;

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, post};
use axum::Router;
use bytes::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_REQUEST_BODY_LENGTH};
use crate::info::{ReceiverStats, TagStats, Tags, Totals};
use crate::model::{Span, Trace, Traces};
use crate::normalizer::normalize_trace;
use crate::sampler::dynamic_config::DynamicConfig;

use listener::LimitedTcpListener;
use rate_limiter::RateLimiter;

/// Header clients fill with the number of traces in the payload.
const HEADER_TRACE_COUNT: &str = "x-datadog-trace-count";

/// Wall-clock bound on draining in-flight requests at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Wire-format versions of the trace intake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiVersion {
    /// JSON, flat list of spans grouped into traces by the agent.
    V01,
    /// JSON, list of traces.
    V02,
    /// JSON or msgpack, list of traces.
    V03,
    /// Like v0.3, and the reply carries the rates by service.
    V04,
}

impl ApiVersion {
    fn accepts_msgpack(self) -> bool {
        matches!(self, ApiVersion::V03 | ApiVersion::V04)
    }

    fn tag(self) -> &'static str {
        match self {
            ApiVersion::V01 => "v0.1",
            ApiVersion::V02 => "v0.2",
            ApiVersion::V03 => "v0.3",
            ApiVersion::V04 => "v0.4",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("error creating tcp listener: {0}")]
    Bind(#[source] io::Error),
    #[error("error creating UDS listener: {0}")]
    BindUnix(#[source] io::Error),
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid msgpack payload: {0}")]
    Msgpack(#[from] rmp_serde::decode::Error),
}

/// The HTTP collector. Holds the admission rate limiter, the per-client
/// stats and the raw-trace channel feeding the worker pool.
pub struct Receiver {
    config: Arc<Config>,
    pub stats: Arc<ReceiverStats>,
    pub rate_limiter: Arc<RateLimiter>,
    dynamic: Arc<DynamicConfig>,
    out: mpsc::Sender<Trace>,
}

impl Receiver {
    pub fn new(
        config: Arc<Config>,
        dynamic: Arc<DynamicConfig>,
        out: mpsc::Sender<Trace>,
    ) -> Arc<Receiver> {
        Arc::new(Receiver {
            config,
            stats: Arc::new(ReceiverStats::new()),
            rate_limiter: RateLimiter::new(),
            dynamic,
            out,
        })
    }

    /// Builds the versioned route table.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/spans", post(v01_traces).put(v01_traces))
            .route("/v0.1/spans", post(v01_traces).put(v01_traces))
            .route("/v0.2/traces", post(v02_traces).put(v02_traces))
            .route("/v0.3/traces", post(v03_traces).put(v03_traces))
            .route("/v0.4/traces", post(v04_traces).put(v04_traces))
            .route("/services", any(handle_services))
            .route("/v0.1/services", any(handle_services))
            .route("/v0.2/services", any(handle_services))
            .route("/v0.3/services", any(handle_services))
            .route("/v0.4/services", any(handle_services))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_LENGTH))
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.receiver_timeout_secs,
            )))
            .with_state(Arc::clone(self))
    }

    /// Serves the receiver until cancellation, then drains in-flight
    /// requests for at most [`SHUTDOWN_DEADLINE`].
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), ReceiverError> {
        let router = self.router();

        let addr = format!("{}:{}", self.config.receiver_host, self.config.receiver_port);
        let tcp = TcpListener::bind(&addr).await.map_err(ReceiverError::Bind)?;
        info!("listening for traces at http://{addr}");
        let limited = LimitedTcpListener::new(tcp, self.config.connection_limit);

        let mut serve_handles = Vec::new();
        {
            let router = router.clone();
            let shutdown = shutdown.clone();
            serve_handles.push(tokio::spawn(async move {
                axum::serve(limited, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                    .map_err(ReceiverError::Serve)
            }));
        }

        #[cfg(unix)]
        if let Some(path) = self.config.receiver_socket.clone() {
            let uds = listener::bind_unix_socket(&path).map_err(ReceiverError::BindUnix)?;
            info!("listening for traces at unix://{path}");
            let shutdown = shutdown.clone();
            serve_handles.push(tokio::spawn(async move {
                axum::serve(uds, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                    .map_err(ReceiverError::Serve)
            }));
        }

        tokio::spawn(Arc::clone(&self.rate_limiter).run(shutdown.clone()));
        tokio::spawn(Arc::clone(&self).stats_loop(shutdown.clone()));

        for handle in serve_handles {
            tokio::select! {
                res = handle => {
                    match res {
                        Ok(res) => res?,
                        Err(e) => warn!("receiver server task failed: {e}"),
                    }
                }
                () = async {
                    shutdown.cancelled().await;
                    tokio::time::sleep(SHUTDOWN_DEADLINE).await;
                } => {
                    warn!("receiver drain deadline exceeded, abandoning in-flight requests");
                }
            }
        }
        Ok(())
    }

    /// Periodically publishes receiver counters and logs a summary line
    /// once a minute.
    async fn stats_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut acc = Totals::default();
        let mut last_log = Instant::now();
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!(
                        "out channel fill: {:.2}",
                        1.0 - self.out.capacity() as f64 / self.out.max_capacity() as f64
                    );
                    acc.acc(&self.stats.flush());
                    if last_log.elapsed() >= Duration::from_secs(60) {
                        ReceiverStats::log_stats(&acc);
                        if !self.stats.languages().is_empty() {
                            debug!("client languages seen: {}", self.stats.languages());
                        }
                        acc = Totals::default();
                        last_log = Instant::now();
                    }
                }
                () = shutdown.cancelled() => return,
            }
        }
    }

    fn tags(&self, headers: &HeaderMap) -> Tags {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        Tags {
            lang: header("datadog-meta-lang"),
            lang_version: header("datadog-meta-lang-version"),
            interpreter: header("datadog-meta-lang-interpreter"),
            tracer_version: header("datadog-meta-tracer-version"),
        }
    }

    fn reply_ok(&self, version: ApiVersion, status: StatusCode) -> Response {
        match version {
            ApiVersion::V01 | ApiVersion::V02 | ApiVersion::V03 => (status, "OK").into_response(),
            ApiVersion::V04 => {
                let rates = self.dynamic.rate_by_service.get_all();
                (status, Json(json!({ "rate_by_service": rates }))).into_response()
            }
        }
    }

    async fn handle_traces(
        self: Arc<Self>,
        version: ApiVersion,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let media = media_type(&headers);
        if media == "application/msgpack" && !version.accepts_msgpack() {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("unsupported media type {media:?} for {}", version.tag()),
            )
                .into_response();
        }

        let ts = self.stats.get_tag_stats(self.tags(&headers));
        let trace_count = trace_count(&headers);

        if !self.rate_limiter.permits(trace_count) {
            ts.payload_refused.fetch_add(1, Ordering::Relaxed);
            let status = if self.config.rate_limiter_429 {
                StatusCode::TOO_MANY_REQUESTS
            } else {
                StatusCode::OK
            };
            return self.reply_ok(version, status);
        }

        let traces = match decode_traces(version, &media, &body) {
            Ok(traces) => traces,
            Err(e) => {
                debug!("cannot decode {} traces payload: {e}", version.tag());
                ts.traces_dropped_decoding
                    .fetch_add(trace_count.max(1), Ordering::Relaxed);
                return (StatusCode::BAD_REQUEST, format!("{e}")).into_response();
            }
        };

        ts.traces_received
            .fetch_add(traces.len() as i64, Ordering::Relaxed);
        ts.traces_bytes.fetch_add(body.len() as i64, Ordering::Relaxed);
        ts.payload_accepted.fetch_add(1, Ordering::Relaxed);

        let response = self.reply_ok(version, StatusCode::OK);
        // Normalization and the (possibly blocking) channel send happen off
        // the request path; the reply is already on its way.
        tokio::spawn(async move {
            self.process_traces(ts, traces).await;
        });
        response
    }

    async fn process_traces(&self, ts: Arc<TagStats>, traces: Traces) {
        for mut trace in traces {
            ts.spans_received
                .fetch_add(trace.len() as i64, Ordering::Relaxed);
            if let Err(e) = normalize_trace(&mut trace) {
                debug!("dropping invalid trace: {e}");
                ts.spans_dropped
                    .fetch_add(trace.len() as i64, Ordering::Relaxed);
                continue;
            }
            if self.out.send(trace).await.is_err() {
                // The worker pool is gone; the pipeline is shutting down.
                return;
            }
        }
    }
}

async fn v01_traces(
    State(receiver): State<Arc<Receiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receiver.handle_traces(ApiVersion::V01, headers, body).await
}

async fn v02_traces(
    State(receiver): State<Arc<Receiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receiver.handle_traces(ApiVersion::V02, headers, body).await
}

async fn v03_traces(
    State(receiver): State<Arc<Receiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receiver.handle_traces(ApiVersion::V03, headers, body).await
}

async fn v04_traces(
    State(receiver): State<Arc<Receiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receiver.handle_traces(ApiVersion::V04, headers, body).await
}

/// Services are no longer forwarded; the payload is accepted and dropped.
async fn handle_services() -> &'static str {
    "OK"
}

/// Media type from the Content-Type header; empty or unparseable values
/// fall back to JSON.
fn media_type(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(|mt| mt.trim().to_ascii_lowercase())
        .filter(|mt| !mt.is_empty())
        .unwrap_or_else(|| "application/json".to_string())
}

fn trace_count(headers: &HeaderMap) -> i64 {
    let Some(value) = headers.get(HEADER_TRACE_COUNT) else {
        return 0;
    };
    match value.to_str().ok().and_then(|v| v.parse::<i64>().ok()) {
        Some(n) => n,
        None => {
            debug!("invalid {HEADER_TRACE_COUNT} header: {value:?}");
            0
        }
    }
}

fn decode_traces(version: ApiVersion, media: &str, body: &Bytes) -> Result<Traces, DecodeError> {
    match version {
        ApiVersion::V01 => {
            let spans: Vec<Span> = serde_json::from_slice(body)?;
            Ok(traces_from_spans(spans))
        }
        ApiVersion::V02 => Ok(serde_json::from_slice(body)?),
        ApiVersion::V03 | ApiVersion::V04 => {
            if media == "application/msgpack" {
                Ok(rmp_serde::from_slice(body)?)
            } else {
                Ok(serde_json::from_slice(body)?)
            }
        }
    }
}

/// Groups a flat list of spans into traces by trace ID (v0.1 format).
fn traces_from_spans(spans: Vec<Span>) -> Traces {
    let mut by_id: std::collections::HashMap<u64, Trace> = std::collections::HashMap::new();
    for span in spans {
        by_id.entry(span.trace_id).or_default().push(span);
    }
    by_id.into_values().collect()
}
