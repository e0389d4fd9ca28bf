// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bucketed stats aggregation.
//!
//! Processed traces stream in from the workers; weighted spans accumulate
//! into buckets aligned on the bucket interval. Only the two most recent
//! buckets accept writes, older ones are flushed by the ticker onto the
//! stats channel. Spans falling before the retained window are counted as
//! late and discarded, so every retained span contributes to exactly one
//! bucket.

mod aggregation;

pub use aggregation::{
    DistributionSummary, GroupedStatsPayload, StatsBucketPayload, SublayerStatPayload,
};

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::model::WeightedTrace;
use crate::sublayers::SublayerValue;

use aggregation::StatsBucket;

/// Number of buckets kept writable when flushing: the current one and the
/// previous one, as a concession to clock skew and late clients.
const BUFFER_LEN: usize = 2;

/// One processed trace's contribution to the stats pipeline.
pub struct Input {
    pub trace: WeightedTrace,
    /// Sublayer values per sub-root, identified by index into `trace`.
    pub sublayers: Vec<(usize, Vec<SublayerValue>)>,
    pub env: String,
}

fn align(ts: i64, bucket_size: i64) -> i64 {
    ts - ts.rem_euclid(bucket_size)
}

fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

/// Aggregates weighted spans into aligned time buckets.
pub struct Concentrator {
    bucket_size: i64,
    buckets: HashMap<i64, StatsBucket>,
    /// Start of the oldest bucket still writable; spans before it are late.
    oldest_ts: i64,
    stats_late_spans: i64,
}

impl Concentrator {
    pub fn new(bucket_interval: Duration, now: SystemTime) -> Concentrator {
        let bucket_size = bucket_interval.as_nanos() as i64;
        Concentrator {
            bucket_size,
            buckets: HashMap::new(),
            oldest_ts: align(unix_nanos(now), bucket_size),
            stats_late_spans: 0,
        }
    }

    /// Number of spans discarded because they fell before the window.
    pub fn late_spans(&self) -> i64 {
        self.stats_late_spans
    }

    /// Adds one processed trace to the aggregation.
    pub fn add(&mut self, input: Input) {
        for ws in &input.trace {
            if !(ws.top_level || ws.measured) {
                continue;
            }
            let bucket_ts = align(ws.span.start, self.bucket_size);
            if bucket_ts < self.oldest_ts {
                self.stats_late_spans += 1;
                continue;
            }
            self.buckets
                .entry(bucket_ts)
                .or_insert_with(|| StatsBucket::new(bucket_ts))
                .insert(&input.env, ws);
        }
        for (idx, values) in &input.sublayers {
            let Some(ws) = input.trace.get(*idx) else {
                continue;
            };
            let bucket_ts = align(ws.span.start, self.bucket_size);
            if bucket_ts < self.oldest_ts {
                continue;
            }
            self.buckets
                .entry(bucket_ts)
                .or_insert_with(|| StatsBucket::new(bucket_ts))
                .insert_sublayers(&input.env, ws, values);
        }
    }

    /// Flushes every bucket older than the retained window; `force` flushes
    /// them all, typically at shutdown.
    pub fn flush(&mut self, now: SystemTime, force: bool) -> Vec<StatsBucketPayload> {
        let now_ts = unix_nanos(now);
        let keep_from = align(now_ts, self.bucket_size) - (BUFFER_LEN as i64 - 1) * self.bucket_size;
        self.oldest_ts = if force {
            align(now_ts, self.bucket_size)
        } else {
            keep_from
        };
        let drained: Vec<(i64, StatsBucket)> = self.buckets.drain().collect();
        let mut flushed = Vec::new();
        for (ts, bucket) in drained {
            if !force && ts >= keep_from {
                self.buckets.insert(ts, bucket);
                continue;
            }
            flushed.push(bucket.flush(self.bucket_size));
        }
        flushed.sort_by_key(|b| b.start);
        flushed
    }
}

/// Channel-driven concentrator service: ingests processed traces and emits
/// closed buckets on every tick.
pub struct ConcentratorService {
    concentrator: Concentrator,
    interval: Duration,
    rx: mpsc::Receiver<Input>,
    out: mpsc::Sender<Vec<StatsBucketPayload>>,
}

impl ConcentratorService {
    pub fn new(
        bucket_interval: Duration,
        rx: mpsc::Receiver<Input>,
        out: mpsc::Sender<Vec<StatsBucketPayload>>,
    ) -> ConcentratorService {
        ConcentratorService {
            concentrator: Concentrator::new(bucket_interval, SystemTime::now()),
            interval: bucket_interval,
            rx,
            out,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                input = self.rx.recv() => match input {
                    Some(input) => self.concentrator.add(input),
                    // Workers are gone, wrap up.
                    None => break,
                },
                _ = tick.tick() => self.emit(false).await,
                () = shutdown.cancelled() => break,
            }
        }
        // Drain whatever the workers managed to enqueue, then emit the
        // final partial bucket.
        while let Ok(input) = self.rx.try_recv() {
            self.concentrator.add(input);
        }
        self.emit(true).await;
        debug!(
            "concentrator exiting, late spans: {}",
            self.concentrator.late_spans()
        );
    }

    async fn emit(&mut self, force: bool) {
        let buckets = self.concentrator.flush(SystemTime::now(), force);
        if buckets.is_empty() {
            return;
        }
        if let Err(e) = self.out.send(buckets).await {
            error!("dropping stats payload, stats writer is gone: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Span, WeightedSpan};

    const BUCKET: Duration = Duration::from_secs(10);
    const BUCKET_NS: i64 = 10_000_000_000;

    fn weighted(start: i64, weight: f64) -> WeightedSpan {
        WeightedSpan {
            span: Span {
                service: "api".to_string(),
                name: "op".to_string(),
                resource: "res".to_string(),
                trace_id: 1,
                span_id: 1,
                start,
                duration: 100,
                ..Default::default()
            },
            weight,
            top_level: true,
            measured: false,
        }
    }

    fn input(spans: Vec<WeightedSpan>) -> Input {
        Input {
            trace: spans,
            sublayers: Vec::new(),
            env: "prod".to_string(),
        }
    }

    #[test]
    fn test_spans_land_in_their_start_bucket() {
        let now = SystemTime::now();
        let now_ns = unix_nanos(now);
        let mut concentrator = Concentrator::new(BUCKET, now);
        concentrator.add(input(vec![weighted(now_ns, 1.0), weighted(now_ns + BUCKET_NS, 1.0)]));
        assert_eq!(concentrator.buckets.len(), 2);
    }

    #[test]
    fn test_stats_conservation() {
        // Total bucket hits equal total ingested weight.
        let now = SystemTime::now();
        let now_ns = unix_nanos(now);
        let mut concentrator = Concentrator::new(BUCKET, now);
        concentrator.add(input(vec![
            weighted(now_ns, 2.0),
            weighted(now_ns, 1.5),
            weighted(now_ns + BUCKET_NS, 0.5),
        ]));
        let buckets = concentrator.flush(now + 10 * BUCKET, true);
        let hits: f64 = buckets
            .iter()
            .flat_map(|b| b.stats.iter())
            .map(|g| g.hits)
            .sum();
        assert!((hits - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_top_level_spans_ignored() {
        let now = SystemTime::now();
        let mut ws = weighted(unix_nanos(now), 1.0);
        ws.top_level = false;
        let mut concentrator = Concentrator::new(BUCKET, now);
        concentrator.add(input(vec![ws]));
        assert!(concentrator.buckets.is_empty());

        // Measured spans do count.
        let mut ws = weighted(unix_nanos(now), 1.0);
        ws.top_level = false;
        ws.measured = true;
        concentrator.add(input(vec![ws]));
        assert_eq!(concentrator.buckets.len(), 1);
    }

    #[test]
    fn test_late_spans_counted_and_discarded() {
        let now = SystemTime::now();
        let mut concentrator = Concentrator::new(BUCKET, now);
        concentrator.add(input(vec![weighted(unix_nanos(now) - 50 * BUCKET_NS, 1.0)]));
        assert_eq!(concentrator.late_spans(), 1);
        assert!(concentrator.buckets.is_empty());
    }

    #[test]
    fn test_flush_retains_recent_buckets() {
        let now = SystemTime::now();
        let now_ns = unix_nanos(now);
        let mut concentrator = Concentrator::new(BUCKET, now);
        concentrator.add(input(vec![weighted(now_ns, 1.0)]));
        // Flushing right away keeps the current bucket buffered.
        assert!(concentrator.flush(now, false).is_empty());
        assert_eq!(concentrator.buckets.len(), 1);
        // Once time has moved past the window it is emitted.
        let later = now + 10 * BUCKET;
        assert_eq!(concentrator.flush(later, false).len(), 1);
    }

    #[test]
    fn test_force_flush_emits_everything() {
        let now = SystemTime::now();
        let mut concentrator = Concentrator::new(BUCKET, now);
        concentrator.add(input(vec![weighted(unix_nanos(now), 1.0)]));
        assert_eq!(concentrator.flush(now, true).len(), 1);
        assert!(concentrator.buckets.is_empty());
    }

    #[test]
    fn test_sublayers_bucketed_with_sub_root() {
        let now = SystemTime::now();
        let now_ns = unix_nanos(now);
        let mut concentrator = Concentrator::new(BUCKET, now);
        let mut inp = input(vec![weighted(now_ns, 2.0)]);
        inp.sublayers = vec![(
            0,
            vec![SublayerValue {
                metric: "_sublayers.span_count".to_string(),
                tag: None,
                value: 3.0,
            }],
        )];
        concentrator.add(inp);
        let buckets = concentrator.flush(now + 10 * BUCKET, true);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].sublayers.len(), 1);
        assert!((buckets[0].sublayers[0].value - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_service_final_flush_on_close() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let service = ConcentratorService::new(BUCKET, in_rx, out_tx);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(service.run(shutdown));

        let now_ns = unix_nanos(SystemTime::now());
        in_tx
            .send(input(vec![weighted(now_ns, 1.0)]))
            .await
            .expect("send");
        drop(in_tx);

        handle.await.expect("service");
        let buckets = out_rx.recv().await.expect("final buckets");
        assert_eq!(buckets.len(), 1);
    }
}
