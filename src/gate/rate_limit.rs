//! Per-key sliding-window request limiter.
//!
//! Admission is granted while the number of requests in the trailing window
//! stays below the ceiling. Old timestamps are pruned lazily on each check,
//! keeping memory bounded by the request rate. Ceiling resolution order:
//! per-tool (prefixed name) → per-key override → global default; the first
//! configured level wins.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Window length for all ceilings.
const WINDOW_SECS: i64 = 60;

// ─── Sliding window ───────────────────────────────────────────────────────────

/// A sliding-window counter over the last [`WINDOW_SECS`] seconds.
pub struct SlidingWindow {
    events: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    /// Discard events older than the window boundary.
    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(WINDOW_SECS);
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    fn count(&mut self, now: DateTime<Utc>) -> u64 {
        self.evict(now);
        self.events.len() as u64
    }

    fn record(&mut self, at: DateTime<Utc>) {
        self.evict(at);
        self.events.push_back(at);
    }
}

// ─── Limiter ──────────────────────────────────────────────────────────────────

/// Configured ceilings. `None` disables that level entirely.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    /// Default ceiling per key per minute.
    pub global_per_minute: Option<u64>,
    /// Per-tool ceilings, keyed by the prefixed public tool name.
    pub per_tool: HashMap<String, u64>,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCheck {
    Ok,
    Limited,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    /// Windows keyed by key id, and by `"<key>\u{1}<tool>"` for per-tool
    /// ceilings. `\u{1}` cannot appear in either component.
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn tool_key(key_id: &str, tool: &str) -> String {
        format!("{key_id}\u{1}{tool}")
    }

    /// Check the applicable ceilings without recording usage.
    pub async fn check(
        &self,
        key_id: &str,
        tool: &str,
        per_key_limit: Option<u64>,
    ) -> RateCheck {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;

        if let Some(ceiling) = self.config.per_tool.get(tool) {
            let window = windows
                .entry(Self::tool_key(key_id, tool))
                .or_insert_with(SlidingWindow::new);
            if window.count(now) >= *ceiling {
                return RateCheck::Limited;
            }
        }

        let key_ceiling = per_key_limit.or(self.config.global_per_minute);
        if let Some(ceiling) = key_ceiling {
            let window = windows
                .entry(key_id.to_string())
                .or_insert_with(SlidingWindow::new);
            if window.count(now) >= ceiling {
                return RateCheck::Limited;
            }
        }

        RateCheck::Ok
    }

    /// Record one admitted request against both the key window and, when a
    /// per-tool ceiling exists, the tool window.
    pub async fn record(&self, key_id: &str, tool: &str) {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        if self.config.per_tool.contains_key(tool) {
            windows
                .entry(Self::tool_key(key_id, tool))
                .or_insert_with(SlidingWindow::new)
                .record(now);
        }
        windows
            .entry(key_id.to_string())
            .or_insert_with(SlidingWindow::new)
            .record(now);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
