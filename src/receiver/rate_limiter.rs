// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Probabilistic admission control at the receiver's front door.
//!
//! The watchdog drives `set_target_rate`; HTTP handlers ask `permits`
//! before decoding a payload. Counters decay every second so the real
//! rate reflects recent traffic only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Fraction of the seen/kept counters surviving each one-second decay.
const DECAY_FACTOR: f64 = 0.9;

#[derive(Debug, Default)]
struct State {
    target_rate: f64,
    /// Decayed payload counts observed recently.
    seen: f64,
    kept: f64,
    /// Total payloads turned away, not decayed.
    refused: u64,
}

/// Snapshot of the limiter's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStats {
    pub target_rate: f64,
    pub real_rate: f64,
    pub recent_payloads_seen: f64,
    pub recent_payloads_kept: f64,
    pub payloads_refused: u64,
}

pub struct RateLimiter {
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new() -> Arc<RateLimiter> {
        Arc::new(RateLimiter {
            state: Mutex::new(State {
                target_rate: 1.0,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Decides whether a payload holding `n` traces may enter. A missing
    /// or zero trace count is billed as one payload.
    pub fn permits(&self, n: i64) -> bool {
        let n = if n <= 0 { 1.0 } else { n as f64 };
        let mut state = self.lock();
        state.seen += n;
        let keep = state.target_rate >= 1.0 || rand::thread_rng().gen::<f64>() < state.target_rate;
        if keep {
            state.kept += n;
        } else {
            state.refused += n as u64;
        }
        keep
    }

    /// Sets the acceptance probability, clamped to [0, 1].
    pub fn set_target_rate(&self, rate: f64) {
        self.lock().target_rate = rate.clamp(0.0, 1.0);
    }

    pub fn target_rate(&self) -> f64 {
        self.lock().target_rate
    }

    /// The observed admission ratio over the recent (decayed) window,
    /// falling back to the target when nothing was seen yet.
    pub fn real_rate(&self) -> f64 {
        let state = self.lock();
        if state.seen > 0.0 {
            state.kept / state.seen
        } else {
            state.target_rate
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.lock();
        RateLimiterStats {
            target_rate: state.target_rate,
            real_rate: if state.seen > 0.0 {
                state.kept / state.seen
            } else {
                state.target_rate
            },
            recent_payloads_seen: state.seen,
            recent_payloads_kept: state.kept,
            payloads_refused: state.refused,
        }
    }

    fn decay(&self) {
        let mut state = self.lock();
        state.seen *= DECAY_FACTOR;
        state.kept *= DECAY_FACTOR;
    }

    /// Background refresh loop decaying the counters every second.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => self.decay(),
                () = shutdown.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_rate_accepts_everything() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.permits(5));
        }
        assert!((limiter.real_rate() - 1.0).abs() < 1e-9);
        assert_eq!(limiter.stats().payloads_refused, 0);
    }

    #[test]
    fn test_zero_rate_refuses_everything() {
        let limiter = RateLimiter::new();
        limiter.set_target_rate(0.0);
        for _ in 0..50 {
            assert!(!limiter.permits(2));
        }
        assert!(limiter.real_rate() < 1e-9);
        assert_eq!(limiter.stats().payloads_refused, 100);
    }

    #[test]
    fn test_real_rate_tracks_target() {
        let limiter = RateLimiter::new();
        limiter.set_target_rate(0.5);
        for _ in 0..5000 {
            limiter.permits(1);
        }
        let real = limiter.real_rate();
        assert!((real - 0.5).abs() < 0.1, "real rate was {real}");
    }

    #[test]
    fn test_zero_count_billed_as_one() {
        let limiter = RateLimiter::new();
        limiter.permits(0);
        assert!((limiter.stats().recent_payloads_seen - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_target_rate_clamped() {
        let limiter = RateLimiter::new();
        limiter.set_target_rate(3.5);
        assert!((limiter.target_rate() - 1.0).abs() < 1e-9);
        limiter.set_target_rate(-1.0);
        assert!(limiter.target_rate().abs() < 1e-9);
    }

    #[test]
    fn test_decay_forgets_old_traffic() {
        let limiter = RateLimiter::new();
        limiter.permits(100);
        for _ in 0..200 {
            limiter.decay();
        }
        assert!(limiter.stats().recent_payloads_seen < 1e-6);
        // With nothing seen recently, real rate falls back to the target.
        limiter.set_target_rate(0.3);
        let limiter2 = RateLimiter::new();
        limiter2.set_target_rate(0.3);
        assert!((limiter2.real_rate() - 0.3).abs() < 1e-9);
    }
}
