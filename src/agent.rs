// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent lifecycle: builds every component, wires the channels between
//! them and coordinates the cooperative shutdown.
//!
//! ```text
//! Receiver --(raw traces, 5000)--> Workers --(sampled spans, 1000)--> TraceWriter
//!                                     |
//!                                     +--(stats input)--> Concentrator --(buckets)--> StatsWriter
//! ```
//!
//! Shutdown is a cascade: cancelling the token stops the receiver (which
//! drains in-flight requests under a deadline), closing the raw-trace
//! channel; the workers drain and exit, closing the downstream channels;
//! the concentrator force-flushes its partial bucket; the writers flush
//! what is left and exit. No task is killed abruptly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::concentrator::ConcentratorService;
use crate::config::Config;
use crate::processor::TraceProcessor;
use crate::receiver::Receiver;
use crate::sampler::dynamic_config::DynamicConfig;
use crate::watchdog::Watchdog;
use crate::writer::{StatsWriter, TraceWriter};

/// Capacity of the receiver-to-workers channel.
const RAW_TRACE_CHANNEL_SIZE: usize = 5000;
/// Capacity of the workers-to-trace-writer channel.
const SAMPLED_SPANS_CHANNEL_SIZE: usize = 1000;
/// Capacity of the workers-to-concentrator channel.
const STATS_INPUT_CHANNEL_SIZE: usize = 100;
/// Capacity of the concentrator-to-stats-writer channel.
const STATS_BUCKET_CHANNEL_SIZE: usize = 10;

/// Runs the whole pipeline until the token is cancelled, then shuts down
/// cooperatively.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let dynamic = Arc::new(DynamicConfig::new());

    let (raw_tx, raw_rx) = mpsc::channel(RAW_TRACE_CHANNEL_SIZE);
    let (spans_tx, spans_rx) = mpsc::channel(SAMPLED_SPANS_CHANNEL_SIZE);
    let (stats_in_tx, stats_in_rx) = mpsc::channel(STATS_INPUT_CHANNEL_SIZE);
    let (bucket_tx, bucket_rx) = mpsc::channel(STATS_BUCKET_CHANNEL_SIZE);

    let receiver = Receiver::new(Arc::clone(&config), Arc::clone(&dynamic), raw_tx);
    let processor = TraceProcessor::new(
        Arc::clone(&config),
        Arc::clone(&receiver.stats),
        Arc::clone(&receiver.rate_limiter),
        dynamic,
        spans_tx,
        stats_in_tx,
    );

    for engine in processor.sampler_engines() {
        tokio::spawn(engine.run(shutdown.clone()));
    }
    let workers = processor.start_workers(raw_rx);

    let concentrator = ConcentratorService::new(
        Duration::from_secs(config.bucket_interval_secs),
        stats_in_rx,
        bucket_tx,
    );
    let concentrator_handle = tokio::spawn(concentrator.run(shutdown.clone()));

    let trace_writer_handle =
        tokio::spawn(TraceWriter::new(Arc::clone(&config), spans_rx).run());
    let stats_writer_handle =
        tokio::spawn(StatsWriter::new(Arc::clone(&config), bucket_rx).run());

    let watchdog = Watchdog::new(
        config.max_memory,
        config.max_cpu,
        Duration::from_secs(config.watchdog_interval_secs),
        Arc::clone(&receiver.rate_limiter),
    );
    tokio::spawn(watchdog.run(shutdown.clone()));

    // The receiver runs in the foreground; it returns once cancellation
    // has been requested and in-flight requests have drained.
    Arc::clone(&receiver).run(shutdown.clone()).await?;
    info!("exiting...");

    // Dropping the last raw-trace senders lets the cascade run: workers
    // drain, the concentrator flushes, the writers empty their buffers.
    drop(receiver);
    let teardown = async {
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("worker task failed: {e}");
            }
        }
        drop(processor);
        if let Err(e) = concentrator_handle.await {
            warn!("concentrator task failed: {e}");
        }
        if let Err(e) = trace_writer_handle.await {
            warn!("trace writer task failed: {e}");
        }
        if let Err(e) = stats_writer_handle.await {
            warn!("stats writer task failed: {e}");
        }
    };
    let deadline = Duration::from_secs(config.watchdog_interval_secs);
    if tokio::time::timeout(deadline, teardown).await.is_err() {
        warn!("pipeline teardown exceeded {deadline:?}, exiting anyway");
    }
    Ok(())
}
