//! Process-wide metrics sink.
//!
//! Everything the query handlers account ends up here: per-upstream
//! success/failure counters and a latency summary, plus the handful of global
//! counters the forwarder emits. Exposed as Prometheus text on the web port.

use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Running summary of observed latencies, in microseconds.
#[derive(Debug, Clone)]
pub struct LatencySummary {
    pub count: u64,
    pub sum_us: u64,
    pub min_us: u64,
    pub max_us: u64,
}

impl Default for LatencySummary {
    fn default() -> Self {
        Self {
            count: 0,
            sum_us: 0,
            min_us: u64::MAX,
            max_us: 0,
        }
    }
}

impl LatencySummary {
    fn observe(&mut self, value_us: u64) {
        self.count += 1;
        self.sum_us += value_us;
        self.min_us = self.min_us.min(value_us);
        self.max_us = self.max_us.max(value_us);
    }

    pub fn avg_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_us as f64 / self.count as f64
        }
    }
}

#[derive(Default)]
struct UpstreamCounters {
    successes: AtomicU64,
    failures: AtomicU64,
    latency: Mutex<LatencySummary>,
}

pub struct Metrics {
    upstreams: DashMap<SocketAddr, UpstreamCounters>,
    ignored_questions: AtomicU64,
    no_upstreams_available: AtomicU64,
    upstreams_failed: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            upstreams: DashMap::new(),
            ignored_questions: AtomicU64::new(0),
            no_upstreams_available: AtomicU64::new(0),
            upstreams_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// A probe against `upstream` produced a reply (winning or draining).
    pub fn record_success(&self, upstream: SocketAddr) {
        self.upstreams
            .entry(upstream)
            .or_default()
            .successes
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A probe against `upstream` failed, timed out, or was abandoned.
    pub fn record_failure(&self, upstream: SocketAddr) {
        self.upstreams
            .entry(upstream)
            .or_default()
            .failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Microseconds between probe spawn and reply receipt.
    pub fn record_latency(&self, upstream: SocketAddr, value_us: u64) {
        self.upstreams
            .entry(upstream)
            .or_default()
            .latency
            .lock()
            .observe(value_us);
    }

    /// Extra questions beyond the first in one request.
    pub fn add_ignored_questions(&self, n: u64) {
        self.ignored_questions.fetch_add(n, Ordering::Relaxed);
    }

    /// The router produced no upstreams for a query.
    pub fn record_no_upstreams(&self) {
        self.no_upstreams_available.fetch_add(1, Ordering::Relaxed);
    }

    /// A query handler gave up without delivering a reply.
    pub fn record_upstreams_failed(&self) {
        self.upstreams_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self, upstream: SocketAddr) -> u64 {
        self.upstreams
            .get(&upstream)
            .map(|c| c.successes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn failures(&self, upstream: SocketAddr) -> u64 {
        self.upstreams
            .get(&upstream)
            .map(|c| c.failures.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn latency(&self, upstream: SocketAddr) -> LatencySummary {
        self.upstreams
            .get(&upstream)
            .map(|c| c.latency.lock().clone())
            .unwrap_or_default()
    }

    pub fn ignored_questions(&self) -> u64 {
        self.ignored_questions.load(Ordering::Relaxed)
    }

    pub fn no_upstreams_available(&self) -> u64 {
        self.no_upstreams_available.load(Ordering::Relaxed)
    }

    pub fn upstreams_failed(&self) -> u64 {
        self.upstreams_failed.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);

        write_help_type(&mut out, "fanout_up", "Whether the forwarder is up.", "gauge");
        writeln!(out, "fanout_up 1").ok();

        write_help_type(
            &mut out,
            "fanout_time_up_seconds_total",
            "Uptime since process start in seconds.",
            "counter",
        );
        writeln!(
            out,
            "fanout_time_up_seconds_total {:.3}",
            self.start_time.elapsed().as_secs_f64()
        )
        .ok();

        write_help_type(
            &mut out,
            "fanout_ignored_questions_total",
            "Questions beyond the first dropped from multi-question requests.",
            "counter",
        );
        writeln!(
            out,
            "fanout_ignored_questions_total {}",
            self.ignored_questions()
        )
        .ok();

        write_help_type(
            &mut out,
            "fanout_no_upstreams_available_total",
            "Queries for which routing produced no upstreams.",
            "counter",
        );
        writeln!(
            out,
            "fanout_no_upstreams_available_total {}",
            self.no_upstreams_available()
        )
        .ok();

        write_help_type(
            &mut out,
            "fanout_upstreams_failed_total",
            "Queries abandoned because every upstream failed or timed out.",
            "counter",
        );
        writeln!(out, "fanout_upstreams_failed_total {}", self.upstreams_failed()).ok();

        write_help_type(
            &mut out,
            "query_fsm_successes_total",
            "Replies received per upstream.",
            "counter",
        );
        write_help_type(
            &mut out,
            "query_fsm_failures_total",
            "Failed or abandoned exchanges per upstream.",
            "counter",
        );
        write_help_type(
            &mut out,
            "query_fsm_latency_microseconds",
            "Exchange latency per upstream in microseconds.",
            "summary",
        );
        for entry in self.upstreams.iter() {
            let upstream = entry.key();
            let successes = entry.value().successes.load(Ordering::Relaxed);
            let failures = entry.value().failures.load(Ordering::Relaxed);
            let latency = entry.value().latency.lock().clone();
            writeln!(
                out,
                "query_fsm_successes_total{{upstream=\"{}\"}} {}",
                upstream, successes
            )
            .ok();
            writeln!(
                out,
                "query_fsm_failures_total{{upstream=\"{}\"}} {}",
                upstream, failures
            )
            .ok();
            writeln!(
                out,
                "query_fsm_latency_microseconds_count{{upstream=\"{}\"}} {}",
                upstream, latency.count
            )
            .ok();
            writeln!(
                out,
                "query_fsm_latency_microseconds_sum{{upstream=\"{}\"}} {}",
                upstream, latency.sum_us
            )
            .ok();
            if latency.count > 0 {
                writeln!(
                    out,
                    "query_fsm_latency_microseconds_min{{upstream=\"{}\"}} {}",
                    upstream, latency.min_us
                )
                .ok();
                writeln!(
                    out,
                    "query_fsm_latency_microseconds_max{{upstream=\"{}\"}} {}",
                    upstream, latency.max_us
                )
                .ok();
            }
        }

        out
    }

    /// JSON snapshot for the stats API.
    pub fn snapshot(&self) -> serde_json::Value {
        let upstreams: Vec<serde_json::Value> = self
            .upstreams
            .iter()
            .map(|entry| {
                let latency = entry.value().latency.lock().clone();
                serde_json::json!({
                    "upstream": entry.key().to_string(),
                    "successes": entry.value().successes.load(Ordering::Relaxed),
                    "failures": entry.value().failures.load(Ordering::Relaxed),
                    "latency_samples": latency.count,
                    "avg_latency_us": latency.avg_us(),
                })
            })
            .collect();

        serde_json::json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "ignored_questions": self.ignored_questions(),
            "no_upstreams_available": self.no_upstreams_available(),
            "upstreams_failed": self.upstreams_failed(),
            "upstreams": upstreams,
        })
    }
}

fn write_help_type(out: &mut String, name: &str, help: &str, metric_type: &str) {
    writeln!(out, "# HELP {} {}", name, help).ok();
    writeln!(out, "# TYPE {} {}", name, metric_type).ok();
}
