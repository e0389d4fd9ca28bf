// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Receiver accounting: counters bucketed by client tags.
//!
//! Counters are plain atomic adds so the hot request path never takes a
//! lock; the surrounding map is read-mostly behind an `RwLock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::info;

/// Client identity derived from the `Datadog-Meta-*` request headers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Tags {
    pub lang: String,
    pub lang_version: String,
    pub interpreter: String,
    pub tracer_version: String,
}

/// Counters tracked for one client tag set. All updates are atomic adds.
#[derive(Debug, Default)]
pub struct TagStats {
    pub traces_received: AtomicI64,
    pub traces_dropped_decoding: AtomicI64,
    pub traces_filtered: AtomicI64,
    pub traces_bytes: AtomicI64,

    pub traces_priority_none: AtomicI64,
    pub traces_priority_neg: AtomicI64,
    pub traces_priority_0: AtomicI64,
    pub traces_priority_1: AtomicI64,
    pub traces_priority_2: AtomicI64,

    pub spans_received: AtomicI64,
    pub spans_dropped: AtomicI64,
    pub spans_filtered: AtomicI64,

    pub payload_accepted: AtomicI64,
    pub payload_refused: AtomicI64,

    pub events_extracted: AtomicI64,
    pub events_sampled: AtomicI64,
}

impl TagStats {
    /// Bumps the priority-class counter matching a trace's priority.
    pub fn count_priority(&self, priority: Option<f64>) {
        let counter = match priority {
            None => &self.traces_priority_none,
            Some(p) if p < 0.0 => &self.traces_priority_neg,
            Some(p) if p == 0.0 => &self.traces_priority_0,
            Some(p) if p == 1.0 => &self.traces_priority_1,
            Some(_) => &self.traces_priority_2,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_and_reset(&self) -> Totals {
        let take = |c: &AtomicI64| c.swap(0, Ordering::Relaxed);
        Totals {
            traces_received: take(&self.traces_received),
            traces_dropped_decoding: take(&self.traces_dropped_decoding),
            traces_filtered: take(&self.traces_filtered),
            traces_bytes: take(&self.traces_bytes),
            spans_received: take(&self.spans_received),
            spans_dropped: take(&self.spans_dropped),
            spans_filtered: take(&self.spans_filtered),
            payload_accepted: take(&self.payload_accepted),
            payload_refused: take(&self.payload_refused),
            events_extracted: take(&self.events_extracted),
            events_sampled: take(&self.events_sampled),
        }
    }
}

/// Aggregated counters over all tag sets for one reporting window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub traces_received: i64,
    pub traces_dropped_decoding: i64,
    pub traces_filtered: i64,
    pub traces_bytes: i64,
    pub spans_received: i64,
    pub spans_dropped: i64,
    pub spans_filtered: i64,
    pub payload_accepted: i64,
    pub payload_refused: i64,
    pub events_extracted: i64,
    pub events_sampled: i64,
}

impl Totals {
    /// Accumulates another window into this one.
    pub fn acc(&mut self, other: &Totals) {
        self.traces_received += other.traces_received;
        self.traces_dropped_decoding += other.traces_dropped_decoding;
        self.traces_filtered += other.traces_filtered;
        self.traces_bytes += other.traces_bytes;
        self.spans_received += other.spans_received;
        self.spans_dropped += other.spans_dropped;
        self.spans_filtered += other.spans_filtered;
        self.payload_accepted += other.payload_accepted;
        self.payload_refused += other.payload_refused;
        self.events_extracted += other.events_extracted;
        self.events_sampled += other.events_sampled;
    }
}

/// All receiver counters, keyed by the client tag set they belong to.
#[derive(Default)]
pub struct ReceiverStats {
    stats: RwLock<HashMap<Tags, Arc<TagStats>>>,
}

impl ReceiverStats {
    pub fn new() -> ReceiverStats {
        ReceiverStats::default()
    }

    /// Returns the stats entry for the given tags, creating it on first use.
    pub fn get_tag_stats(&self, tags: Tags) -> Arc<TagStats> {
        if let Ok(stats) = self.stats.read() {
            if let Some(ts) = stats.get(&tags) {
                return Arc::clone(ts);
            }
        }
        let mut stats = match self.stats.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(stats.entry(tags).or_default())
    }

    /// The sorted, pipe-separated list of client languages seen so far.
    pub fn languages(&self) -> String {
        let stats = match self.stats.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut langs: Vec<&str> = stats
            .keys()
            .map(|t| t.lang.as_str())
            .filter(|l| !l.is_empty())
            .collect();
        langs.sort_unstable();
        langs.dedup();
        langs.join("|")
    }

    /// Drains the current window's counters into one aggregate.
    pub fn flush(&self) -> Totals {
        let stats = match self.stats.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut totals = Totals::default();
        for ts in stats.values() {
            totals.acc(&ts.snapshot_and_reset());
        }
        totals
    }

    /// Logs a one-line summary of an accumulated window.
    pub fn log_stats(totals: &Totals) {
        if *totals == Totals::default() {
            info!("no data received");
            return;
        }
        info!(
            "receiver: traces received: {}, spans received: {}, traces dropped: {}, traces filtered: {}, payloads refused: {}",
            totals.traces_received,
            totals.spans_received,
            totals.traces_dropped_decoding,
            totals.traces_filtered,
            totals.payload_refused,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_stats_reused_per_tags() {
        let stats = ReceiverStats::new();
        let tags = Tags {
            lang: "go".to_string(),
            ..Default::default()
        };
        let a = stats.get_tag_stats(tags.clone());
        a.traces_received.fetch_add(3, Ordering::Relaxed);
        let b = stats.get_tag_stats(tags);
        assert_eq!(b.traces_received.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_priority_classification() {
        let ts = TagStats::default();
        ts.count_priority(None);
        ts.count_priority(Some(-1.0));
        ts.count_priority(Some(0.0));
        ts.count_priority(Some(1.0));
        ts.count_priority(Some(2.0));
        ts.count_priority(Some(5.0));
        assert_eq!(ts.traces_priority_none.load(Ordering::Relaxed), 1);
        assert_eq!(ts.traces_priority_neg.load(Ordering::Relaxed), 1);
        assert_eq!(ts.traces_priority_0.load(Ordering::Relaxed), 1);
        assert_eq!(ts.traces_priority_1.load(Ordering::Relaxed), 1);
        assert_eq!(ts.traces_priority_2.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_flush_resets_counters() {
        let stats = ReceiverStats::new();
        let ts = stats.get_tag_stats(Tags::default());
        ts.spans_received.fetch_add(7, Ordering::Relaxed);
        let totals = stats.flush();
        assert_eq!(totals.spans_received, 7);
        assert_eq!(stats.flush().spans_received, 0);
    }

    #[test]
    fn test_languages() {
        let stats = ReceiverStats::new();
        for lang in ["python", "go", "python"] {
            stats.get_tag_stats(Tags {
                lang: lang.to_string(),
                tracer_version: format!("{lang}-v1"),
                ..Default::default()
            });
        }
        assert_eq!(stats.languages(), "go|python");
    }
}
