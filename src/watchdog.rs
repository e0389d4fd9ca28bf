// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resource watchdog.
//!
//! On every tick the watchdog samples the process RSS and recent user CPU
//! and feeds a new target rate into the admission rate limiter:
//! `min(clip01(max_mem/mem · rate), clip01(max_cpu/cpu · rate))`. Memory
//! beyond 1.5x the ceiling triggers the hard OOM interlock: the process is
//! killed rather than allowed to pollute host memory.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::unistd::{sysconf, SysconfVar};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::receiver::rate_limiter::RateLimiter;

const PROC_SELF_STAT: &str = "/proc/self/stat";
const PROC_SELF_STATM: &str = "/proc/self/statm";

/// Memory overrun factor beyond which the process is killed.
const OOM_KILL_FACTOR: f64 = 1.5;

/// Outcome of one watchdog evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Memory is beyond the kill threshold; the process must die.
    Kill { current: f64, allowed: f64 },
    /// Keep running with this admission target rate.
    Throttle {
        rate: f64,
        rate_mem: f64,
        rate_cpu: f64,
    },
}

fn clip01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Next rate keeping `current` usage under `max`, starting from the rate
/// currently in effect. Zero usage means no pressure at all.
fn rate_limiting_rate(max: f64, current: f64, current_rate: f64) -> f64 {
    if current <= 0.0 {
        return 1.0;
    }
    clip01(max / current * current_rate)
}

/// Pure decision function: memory and CPU readings in, kill-or-throttle
/// out. Ceilings set to zero disable the respective limit.
pub fn evaluate(max_memory: f64, max_cpu: f64, mem: f64, user_cpu: f64, real_rate: f64) -> Decision {
    let mut rate_mem = 1.0;
    if max_memory > 0.0 {
        let allowed = max_memory * OOM_KILL_FACTOR;
        if mem > allowed {
            return Decision::Kill {
                current: mem,
                allowed,
            };
        }
        rate_mem = rate_limiting_rate(max_memory, mem, real_rate);
    }
    let mut rate_cpu = 1.0;
    if max_cpu > 0.0 {
        rate_cpu = rate_limiting_rate(max_cpu, user_cpu, real_rate);
    }
    Decision::Throttle {
        rate: rate_mem.min(rate_cpu),
        rate_mem,
        rate_cpu,
    }
}

/// Resident set size of this process, in bytes.
pub fn resident_memory_bytes() -> Option<f64> {
    let statm = fs::read_to_string(PROC_SELF_STATM).ok()?;
    let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as f64,
        _ => 4096.0,
    };
    Some(resident_pages * page_size)
}

fn read_user_ticks() -> Option<f64> {
    let stat = fs::read_to_string(PROC_SELF_STAT).ok()?;
    // The comm field may contain spaces; fields resume after the last ')'.
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // utime is the 14th field of the file, the 12th after comm.
    after_comm.split_whitespace().nth(11)?.parse().ok()
}

/// Tracks user CPU consumption between ticks and reports it as a fraction
/// of one core.
struct CpuReader {
    last_ticks: f64,
    last_time: Instant,
    clk_tck: f64,
}

impl CpuReader {
    fn new() -> CpuReader {
        let clk_tck = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(tck)) if tck > 0 => tck as f64,
            _ => 100.0,
        };
        CpuReader {
            last_ticks: read_user_ticks().unwrap_or(0.0),
            last_time: Instant::now(),
            clk_tck,
        }
    }

    fn user_avg(&mut self) -> f64 {
        let Some(ticks) = read_user_ticks() else {
            debug!("could not read user CPU from {PROC_SELF_STAT}");
            return 0.0;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        let delta = (ticks - self.last_ticks).max(0.0);
        self.last_ticks = ticks;
        self.last_time = now;
        if elapsed <= 0.0 {
            return 0.0;
        }
        (delta / self.clk_tck) / elapsed
    }
}

/// Periodic resource sampler feeding the admission rate limiter.
pub struct Watchdog {
    max_memory: f64,
    max_cpu: f64,
    interval: Duration,
    rate_limiter: Arc<RateLimiter>,
    cpu: CpuReader,
}

impl Watchdog {
    pub fn new(
        max_memory: f64,
        max_cpu: f64,
        interval: Duration,
        rate_limiter: Arc<RateLimiter>,
    ) -> Watchdog {
        Watchdog {
            max_memory,
            max_cpu,
            interval,
            rate_limiter,
            cpu: CpuReader::new(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and would read a zero CPU delta.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick(),
                () = shutdown.cancelled() => return,
            }
        }
    }

    fn tick(&mut self) {
        let mem = resident_memory_bytes().unwrap_or(0.0);
        let user_cpu = self.cpu.user_avg();
        match evaluate(
            self.max_memory,
            self.max_cpu,
            mem,
            user_cpu,
            self.rate_limiter.real_rate(),
        ) {
            Decision::Kill { current, allowed } => {
                // Safety interlock, not graceful shutdown: a process this
                // far over its memory ceiling is likely leaking.
                error!(
                    oom_kill = 1,
                    "killing process, memory threshold exceeded: {:.2}M / {:.2}M",
                    current / 1024.0 / 1024.0,
                    allowed / 1024.0 / 1024.0,
                );
                std::process::exit(1);
            }
            Decision::Throttle {
                rate,
                rate_mem,
                rate_cpu,
            } => {
                if rate_mem < 1.0 {
                    warn!(
                        "memory threshold exceeded (max_memory: {:.0} bytes): {:.0}",
                        self.max_memory, mem
                    );
                }
                if rate_cpu < 1.0 {
                    warn!(
                        "CPU threshold exceeded (max_cpu_percent: {:.0}): {:.0}",
                        self.max_cpu * 100.0,
                        user_cpu * 100.0
                    );
                }
                self.rate_limiter.set_target_rate(rate);
                debug!(
                    heap_alloc = mem,
                    cpu_percent = user_cpu * 100.0,
                    ratelimit = rate,
                    "watchdog tick"
                );
            }
        }
    }
}
