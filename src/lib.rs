// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Datadog APM Agent
//!
//! A trace ingestion and sampling pipeline: accepts distributed-tracing
//! payloads from in-application tracers over HTTP, normalizes and sanitizes
//! them, computes statistical aggregates and per-trace sublayer metrics,
//! applies a composite sampling policy and forwards the kept traces plus all
//! stats to the Datadog intake.
//!
//! ## Architecture
//!
//! ```text
//! tracers → Receiver → raw-trace channel → Worker Pool → Process(trace)
//!                                              ├→ Samplers + Event Extractor → Trace Writer
//!                                              └→ Concentrator → Stats Writer
//! ```
//!
//! Control flow: the [`watchdog`] periodically inspects process memory and
//! CPU and adjusts the receiver's admission rate limiter, which gates HTTP
//! acceptance.

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

/// Agent lifecycle: wiring of channels, services and shutdown
pub mod agent;

/// Configuration from environment variables
pub mod config;

/// Time-bucketed stats aggregation
pub mod concentrator;

/// Analyzed-event extraction with a global EPS cap
pub mod event;

/// Resource blacklister and tag replace rules
pub mod filters;

/// Receiver accounting: per-client tag stats
pub mod info;

/// Span and trace data model
pub mod model;

/// Per-trace structural validation and field coercion
pub mod normalizer;

/// In-place span sanitization
pub mod obfuscate;

/// Worker pool and the per-trace processing unit
pub mod processor;

/// HTTP receiver: version-dispatched trace intake
pub mod receiver;

/// Priority, score and errors samplers
pub mod sampler;

/// Top-level span marks and sublayer metrics
pub mod sublayers;

/// Resource watchdog feeding the admission rate limiter
pub mod watchdog;

/// Trace and stats writers flushing to the intake
pub mod writer;
