//! Per-renderer counters.
//!
//! Every adapter owns one [`RenderStats`] and calls [`RenderStats::record`]
//! exactly once per `render` call, on the success path and on every failure
//! path. Derived values are computed when a [`StatsSnapshot`] is taken and
//! are never stored.

use serde::{Serialize, Serializer};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Write a `Duration` as fractional seconds.
pub(crate) fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    pages_rendered: u64,
    successful_renders: u64,
    render_errors: u64,
    total_render_time: Duration,
}

/// Running counters for a single renderer instance.
#[derive(Debug, Default)]
pub struct RenderStats {
    counters: Mutex<Counters>,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one finished render attempt and return its elapsed time.
    ///
    /// Only successful attempts contribute to `total_render_time`.
    pub fn record(&self, started: Instant, success: bool) -> Duration {
        let elapsed = started.elapsed();
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.pages_rendered += 1;
        if success {
            c.successful_renders += 1;
            c.total_render_time += elapsed;
        } else {
            c.render_errors += 1;
        }
        elapsed
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = *self.counters.lock().unwrap_or_else(|e| e.into_inner());
        StatsSnapshot::from_counters(c)
    }
}

/// Point-in-time view of a renderer's counters, including derived values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub pages_rendered: u64,
    pub successful_renders: u64,
    pub render_errors: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub total_render_time: Duration,
    /// `total_render_time / successful_renders`, zero without successes
    #[serde(serialize_with = "serialize_secs")]
    pub avg_render_time: Duration,
    /// Percentage of attempts that succeeded, zero without attempts
    pub success_rate: f64,
}

impl StatsSnapshot {
    fn from_counters(c: Counters) -> Self {
        let avg_render_time = if c.successful_renders > 0 {
            c.total_render_time.div_f64(c.successful_renders as f64)
        } else {
            Duration::ZERO
        };
        let success_rate = if c.pages_rendered > 0 {
            c.successful_renders as f64 / c.pages_rendered as f64 * 100.0
        } else {
            0.0
        };
        Self {
            pages_rendered: c.pages_rendered,
            successful_renders: c.successful_renders,
            render_errors: c.render_errors,
            total_render_time: c.total_render_time,
            avg_render_time,
            success_rate,
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pages_rendered={} successful={} errors={} avg={:.2}s success_rate={:.1}%",
            self.pages_rendered,
            self.successful_renders,
            self.render_errors,
            self.avg_render_time.as_secs_f64(),
            self.success_rate
        )
    }
}
