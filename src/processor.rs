// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-trace processing unit and the worker pool running it.
//!
//! A trace is owned by exactly one worker from the moment it leaves the
//! raw-trace channel: every derived metric (top-level marks, sublayers,
//! sample rates) is computed here, sequentially, before the payload is
//! handed to the samplers and the concentrator. Nothing mutates span
//! metrics after that hand-off.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::concentrator::Input;
use crate::config::Config;
use crate::event;
use crate::filters::{Blacklister, Replacer};
use crate::info::{ReceiverStats, TagStats, Tags};
use crate::model::{self, Trace, WeightedTrace};
use crate::obfuscate::{truncate_span, Obfuscator};
use crate::receiver::rate_limiter::RateLimiter;
use crate::sampler::priority::PrioritySampler;
use crate::sampler::score::{ScoreEngine, ScoreSampler};
use crate::sampler::{self, dynamic_config::DynamicConfig};
use crate::sublayers::{
    compute_sublayers, compute_top_level, extract_top_level_subtraces, set_sublayers_on_span,
    SublayerValue,
};
use crate::writer::SampledSpans;

/// A trace with everything the samplers and the concentrator need,
/// computed once by the owning worker. Sublayer values reference spans by
/// index into the trace.
pub struct ProcessedTrace {
    pub trace: Trace,
    pub weighted: WeightedTrace,
    pub root: usize,
    pub env: String,
    pub sublayers: Vec<(usize, Vec<SublayerValue>)>,
}

/// Runs every stage of the per-trace pipeline.
pub struct TraceProcessor {
    config: Arc<Config>,
    stats: Arc<ReceiverStats>,
    rate_limiter: Arc<RateLimiter>,
    blacklister: Blacklister,
    replacer: Replacer,
    obfuscator: Obfuscator,
    priority_sampler: PrioritySampler,
    score_sampler: ScoreSampler,
    errors_sampler: ScoreSampler,
    event_processor: event::Processor,
    spans_out: mpsc::Sender<SampledSpans>,
    stats_in: mpsc::Sender<Input>,
}

impl TraceProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        stats: Arc<ReceiverStats>,
        rate_limiter: Arc<RateLimiter>,
        dynamic: Arc<DynamicConfig>,
        spans_out: mpsc::Sender<SampledSpans>,
        stats_in: mpsc::Sender<Input>,
    ) -> Arc<TraceProcessor> {
        Arc::new(TraceProcessor {
            blacklister: Blacklister::new(&config.ignore_resources),
            replacer: Replacer::new(config.replace_tags.clone()),
            obfuscator: Obfuscator::new(),
            priority_sampler: PrioritySampler::new(
                config.target_tps,
                config.extra_sample_rate,
                dynamic,
            ),
            score_sampler: ScoreSampler::new(config.target_tps, config.extra_sample_rate),
            errors_sampler: ScoreSampler::new(config.error_tps, config.extra_sample_rate),
            event_processor: event::Processor::from_config(&config),
            config,
            stats,
            rate_limiter,
            spans_out,
            stats_in,
        })
    }

    /// Engines that need the one-second refresh loop.
    pub fn sampler_engines(&self) -> Vec<Arc<ScoreEngine>> {
        vec![
            self.priority_sampler.engine(),
            self.score_sampler.engine(),
            self.errors_sampler.engine(),
        ]
    }

    /// Spawns one worker per CPU, all draining the raw-trace channel.
    /// Workers exit when the channel closes.
    pub fn start_workers(
        self: &Arc<Self>,
        rx: mpsc::Receiver<Trace>,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        (0..num_cpus::get().max(1))
            .map(|_| {
                let processor = Arc::clone(self);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let trace = { rx.lock().await.recv().await };
                        match trace {
                            Some(trace) => processor.process(trace).await,
                            None => return,
                        }
                    }
                })
            })
            .collect()
    }

    /// The default work unit: receives a normalized trace, transforms it
    /// and passes it downstream.
    pub async fn process(&self, mut trace: Trace) {
        if trace.is_empty() {
            debug!("skipping received empty trace");
            return;
        }

        let root = model::root_index(&trace);
        // TODO: use the tag stats of the payload this trace arrived in
        // (per lang/version) instead of the catch-all entry.
        let ts = self.stats.get_tag_stats(Tags::default());

        // Priority is read once, up front: later stages write to the same
        // metrics map and the value must predate them.
        let priority = sampler::get_sampling_priority(&trace[root]);
        ts.count_priority(priority);

        if !self.blacklister.allows(&trace[root]) {
            debug!("trace rejected by blacklister, resource: {}", trace[root].resource);
            ts.traces_filtered.fetch_add(1, Ordering::Relaxed);
            ts.spans_filtered
                .fetch_add(trace.len() as i64, Ordering::Relaxed);
            return;
        }

        for span in trace.iter_mut() {
            self.obfuscator.obfuscate_span(span);
            truncate_span(span);
        }
        self.replacer.replace(&mut trace);

        // The client rate is whatever global rate the tracer left on the
        // root; fold the admission pre-sample rate on top of it.
        let client_rate = sampler::get_global_rate(&trace[root]);
        sampler::set_client_rate(&mut trace[root], client_rate);
        let pre_sample_rate = self.rate_limiter.real_rate();
        sampler::set_pre_sample_rate(&mut trace[root], pre_sample_rate);
        sampler::add_global_rate(&mut trace[root], pre_sample_rate);

        // Top-level marks and sublayers mutate span metrics, so they run
        // before anything downstream can observe the trace.
        compute_top_level(&mut trace);
        let mut sublayers: Vec<(usize, Vec<SublayerValue>)> = Vec::new();
        for subtrace in extract_top_level_subtraces(&trace) {
            let values = compute_sublayers(&trace, &subtrace.spans);
            set_sublayers_on_span(&mut trace[subtrace.root], &values);
            sublayers.push((subtrace.root, values));
        }

        let env = model::trace_env(&trace)
            .unwrap_or(&self.config.default_env)
            .to_string();
        let mut pt = ProcessedTrace {
            weighted: model::weighted_trace(&trace, root),
            trace,
            root,
            env,
            sublayers,
        };

        // Client-dropped traces (negative priority) skip sampling; a
        // missing priority falls through to the score samplers.
        if priority.is_none_or(|p| p >= 0.0) {
            self.sample(&ts, &mut pt, priority).await;
        }

        let input = Input {
            trace: pt.weighted,
            sublayers: pt.sublayers,
            env: pt.env,
        };
        if self.stats_in.send(input).await.is_err() {
            debug!("concentrator is gone, dropping stats input");
        }
    }

    /// Decides whether the trace is kept and extracts analyzed events.
    async fn sample(&self, ts: &TagStats, pt: &mut ProcessedTrace, priority: Option<f64>) {
        let (sampled, rate) = self.run_samplers(pt, priority);

        let mut ss = SampledSpans::default();
        if sampled {
            sampler::add_global_rate(&mut pt.trace[pt.root], rate);
            ss.trace = pt.trace.clone();
        }

        let (events, extracted) = self.event_processor.process(&pt.trace[pt.root], &pt.trace);
        ts.events_extracted.fetch_add(extracted, Ordering::Relaxed);
        ts.events_sampled
            .fetch_add(events.len() as i64, Ordering::Relaxed);
        ss.events = events;

        if !ss.is_empty() && self.spans_out.send(ss).await.is_err() {
            debug!("trace writer is gone, dropping sampled spans");
        }
    }

    /// Runs the samplers applying to this trace and combines their
    /// decisions: priority only when the client set one, errors-score when
    /// the trace carries an error, plain score otherwise.
    fn run_samplers(&self, pt: &ProcessedTrace, priority: Option<f64>) -> (bool, f64) {
        let root = &pt.trace[pt.root];
        let (mut sampled_priority, mut rate_priority) = (false, 0.0);
        if priority.is_some() {
            (sampled_priority, rate_priority) = self.priority_sampler.add(&pt.env, root);
        }
        let (sampled_score, rate_score) = if model::trace_contains_error(&pt.trace) {
            self.errors_sampler.add(&pt.env, root)
        } else {
            self.score_sampler.add(&pt.env, root)
        };
        (
            sampled_priority || sampled_score,
            sampler::combine_rates(rate_priority, rate_score),
        )
    }
}
