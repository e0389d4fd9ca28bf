// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bulk writers flushing kept traces and stats to the intake.
//!
//! Both writers buffer what the pipeline hands them and flush on a timer,
//! plus once more when their input channel closes at shutdown. Delivery is
//! at-most-once: a failed flush is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::concentrator::StatsBucketPayload;
use crate::config::Config;
use crate::model::{Span, Trace};

const API_KEY_HEADER: &str = "DD-Api-Key";

/// The outcome of sampling one trace: the kept spans and the extracted
/// analyzed events. Either side may be empty; a fully empty value is
/// never emitted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampledSpans {
    pub trace: Trace,
    pub events: Vec<Span>,
}

impl SampledSpans {
    pub fn is_empty(&self) -> bool {
        self.trace.is_empty() && self.events.is_empty()
    }
}

#[derive(Serialize)]
struct TracePayload<'a> {
    traces: Vec<&'a Trace>,
    transactions: Vec<&'a Span>,
}

fn build_client(timeout: Duration) -> Option<reqwest::Client> {
    match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => Some(client),
        Err(e) => {
            error!("failed to create HTTP client: {e}");
            None
        }
    }
}

/// Consumes the sampled-spans channel and flushes trace payloads.
pub struct TraceWriter {
    config: Arc<Config>,
    client: Option<reqwest::Client>,
    rx: mpsc::Receiver<SampledSpans>,
    pending: Vec<SampledSpans>,
}

impl TraceWriter {
    pub fn new(config: Arc<Config>, rx: mpsc::Receiver<SampledSpans>) -> TraceWriter {
        TraceWriter {
            client: build_client(Duration::from_secs(30)),
            config,
            rx,
            pending: Vec::new(),
        }
    }

    /// Runs until the sampled-spans channel closes, then flushes one last
    /// time.
    pub async fn run(mut self) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.trace_flush_interval_secs));
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(ss) => self.pending.push(ss),
                    None => break,
                },
                _ = tick.tick() => self.flush().await,
            }
        }
        self.flush().await;
        debug!("trace writer exiting");
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        let payload = TracePayload {
            traces: batch
                .iter()
                .filter(|ss| !ss.trace.is_empty())
                .map(|ss| &ss.trace)
                .collect(),
            transactions: batch.iter().flat_map(|ss| ss.events.iter()).collect(),
        };
        debug!(
            "flushing {} traces, {} events",
            payload.traces.len(),
            payload.transactions.len()
        );

        let Some(api_key) = self.config.api_key.as_deref() else {
            debug!("no API key configured, dropping trace payload");
            return;
        };
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let body = match rmp_serde::to_vec_named(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to encode trace payload: {e}");
                return;
            }
        };
        let result = client
            .post(&self.config.trace_intake_url)
            .header(API_KEY_HEADER, api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/msgpack")
            .body(body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!("successfully flushed traces")
            }
            Ok(response) => error!("trace intake returned {}", response.status()),
            Err(e) => error!("error sending traces: {e}"),
        }
    }
}

#[derive(Serialize)]
struct StatsPayload<'a> {
    env: &'a str,
    stats: &'a [StatsBucketPayload],
}

/// Consumes flushed stats buckets and ships them to the stats intake.
pub struct StatsWriter {
    config: Arc<Config>,
    client: Option<reqwest::Client>,
    rx: mpsc::Receiver<Vec<StatsBucketPayload>>,
    pending: Vec<StatsBucketPayload>,
}

impl StatsWriter {
    pub fn new(config: Arc<Config>, rx: mpsc::Receiver<Vec<StatsBucketPayload>>) -> StatsWriter {
        StatsWriter {
            client: build_client(Duration::from_secs(30)),
            config,
            rx,
            pending: Vec::new(),
        }
    }

    /// Runs until the stats channel closes, then flushes one last time.
    pub async fn run(mut self) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.stats_flush_interval_secs));
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(buckets) => self.pending.extend(buckets),
                    None => break,
                },
                _ = tick.tick() => self.flush().await,
            }
        }
        self.flush().await;
        debug!("stats writer exiting");
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let buckets = std::mem::take(&mut self.pending);
        debug!("flushing {} stats buckets", buckets.len());
        let Some(api_key) = self.config.api_key.as_deref() else {
            debug!("no API key configured, dropping stats payload");
            return;
        };
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let payload = StatsPayload {
            env: &self.config.default_env,
            stats: &buckets,
        };
        let result = client
            .post(&self.config.stats_intake_url)
            .header(API_KEY_HEADER, api_key)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!("successfully flushed stats")
            }
            Ok(response) => error!("stats intake returned {}", response.status()),
            Err(e) => error!("error sending stats: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampled_spans_empty() {
        assert!(SampledSpans::default().is_empty());
        let with_trace = SampledSpans {
            trace: vec![Span::default()],
            events: Vec::new(),
        };
        assert!(!with_trace.is_empty());
        let with_events = SampledSpans {
            trace: Vec::new(),
            events: vec![Span::default()],
        };
        assert!(!with_events.is_empty());
    }

    #[tokio::test]
    async fn test_trace_writer_exits_on_channel_close() {
        // No API key: payloads are dropped locally, nothing leaves the box.
        let (tx, rx) = mpsc::channel(4);
        let writer = TraceWriter::new(Arc::new(Config::default()), rx);
        let handle = tokio::spawn(writer.run());
        tx.send(SampledSpans {
            trace: vec![Span::default()],
            events: Vec::new(),
        })
        .await
        .expect("send");
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("writer exits")
            .expect("writer does not panic");
    }

    #[tokio::test]
    async fn test_stats_writer_exits_on_channel_close() {
        let (tx, rx) = mpsc::channel::<Vec<StatsBucketPayload>>(4);
        let writer = StatsWriter::new(Arc::new(Config::default()), rx);
        let handle = tokio::spawn(writer.run());
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("writer exits")
            .expect("writer does not panic");
    }

    #[test]
    fn test_trace_payload_splits_traces_and_events() {
        let batch = vec![
            SampledSpans {
                trace: vec![Span::default()],
                events: vec![Span::default(), Span::default()],
            },
            SampledSpans {
                trace: Vec::new(),
                events: vec![Span::default()],
            },
        ];
        let payload = TracePayload {
            traces: batch
                .iter()
                .filter(|ss| !ss.trace.is_empty())
                .map(|ss| &ss.trace)
                .collect(),
            transactions: batch.iter().flat_map(|ss| ss.events.iter()).collect(),
        };
        assert_eq!(payload.traces.len(), 1);
        assert_eq!(payload.transactions.len(), 3);
    }
}
