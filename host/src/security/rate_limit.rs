//! Per-tool call rate limiting
//!
//! Each tool id gets a fixed window counter for the minute and one for the
//! hour. A window resets once more than its length has elapsed since it
//! started.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Call counter for one window
#[derive(Debug, Clone, Copy)]
pub struct RateLimitCounter {
    pub count: u32,
    pub window_start: Instant,
}

impl RateLimitCounter {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn roll(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.window_start) > window {
            self.count = 0;
            self.window_start = now;
        }
    }
}

/// Outcome of recording one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Call admitted; calls left in the current minute
    Allowed { remaining: u32 },
    MinuteExceeded { limit: u32 },
    HourExceeded { limit: u32 },
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    minute: HashMap<String, RateLimitCounter>,
    hour: HashMap<String, RateLimitCounter>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call for `tool_id` at `now` and decide whether it is admitted
    ///
    /// Rejected calls are not counted.
    pub fn check(&mut self, tool_id: &str, now: Instant, per_minute: u32, per_hour: u32) -> RateDecision {
        let minute = self
            .minute
            .entry(tool_id.to_string())
            .or_insert_with(|| RateLimitCounter::new(now));
        minute.roll(now, MINUTE);

        let hour = self
            .hour
            .entry(tool_id.to_string())
            .or_insert_with(|| RateLimitCounter::new(now));
        hour.roll(now, HOUR);

        if minute.count >= per_minute {
            return RateDecision::MinuteExceeded { limit: per_minute };
        }
        if hour.count >= per_hour {
            return RateDecision::HourExceeded { limit: per_hour };
        }

        minute.count += 1;
        hour.count += 1;
        RateDecision::Allowed {
            remaining: per_minute - minute.count,
        }
    }

    /// Current minute counter for a tool
    pub fn counter(&self, tool_id: &str) -> Option<RateLimitCounter> {
        self.minute.get(tool_id).copied()
    }

    pub fn reset(&mut self) {
        self.minute.clear();
        self.hour.clear();
    }
}
