//! Dual-window budget for calls against the text generation service.
//!
//! Windows are fixed and calendar-like: each one starts when the budget is
//! created and restarts at `now + length` the first time the clock is observed
//! at or past its deadline. Nothing here is persisted.

use std::time::Duration;

use flairbot_core::current_unix_timestamp_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Limit and length of one budget window.
pub struct RateWindowConfig {
    pub limit: u32,
    pub length: Duration,
}

impl RateWindowConfig {
    pub fn new(limit: u32, length: Duration) -> Self {
        Self { limit, length }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Identifies which window produced an exhaustion.
pub enum RateWindowKind {
    Short,
    Long,
}

impl RateWindowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of a budget check or acquisition.
pub enum BudgetDecision {
    Granted,
    Exhausted {
        window: RateWindowKind,
        wait: Duration,
    },
}

impl BudgetDecision {
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

#[derive(Debug, Clone)]
struct RateWindow {
    kind: RateWindowKind,
    limit: u32,
    length_ms: u64,
    count: u32,
    deadline_unix_ms: u64,
}

impl RateWindow {
    fn new(kind: RateWindowKind, config: RateWindowConfig, now_unix_ms: u64) -> Self {
        let length_ms = u64::try_from(config.length.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        Self {
            kind,
            limit: config.limit.max(1),
            length_ms,
            count: 0,
            deadline_unix_ms: now_unix_ms.saturating_add(length_ms),
        }
    }

    fn roll(&mut self, now_unix_ms: u64) {
        if now_unix_ms >= self.deadline_unix_ms {
            self.count = 0;
            self.deadline_unix_ms = now_unix_ms.saturating_add(self.length_ms);
        }
    }

    fn is_exhausted(&self) -> bool {
        self.count >= self.limit
    }

    fn remaining(&self, now_unix_ms: u64) -> Duration {
        Duration::from_millis(self.deadline_unix_ms.saturating_sub(now_unix_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Point-in-time counters, used for log lines.
pub struct RateBudgetUsage {
    pub short_count: u32,
    pub short_limit: u32,
    pub long_count: u32,
    pub long_limit: u32,
}

#[derive(Debug, Clone)]
/// Short and long call windows guarding the generation service.
pub struct RateBudget {
    short: RateWindow,
    long: RateWindow,
}

impl RateBudget {
    pub fn new(short: RateWindowConfig, long: RateWindowConfig) -> Self {
        Self::new_at(short, long, current_unix_timestamp_ms())
    }

    pub fn new_at(short: RateWindowConfig, long: RateWindowConfig, now_unix_ms: u64) -> Self {
        Self {
            short: RateWindow::new(RateWindowKind::Short, short, now_unix_ms),
            long: RateWindow::new(RateWindowKind::Long, long, now_unix_ms),
        }
    }

    /// Rolls expired windows and reports whether a call could be issued now,
    /// without spending anything.
    pub fn check_at(&mut self, now_unix_ms: u64) -> BudgetDecision {
        self.short.roll(now_unix_ms);
        self.long.roll(now_unix_ms);

        [&self.short, &self.long]
            .into_iter()
            .filter(|window| window.is_exhausted())
            .map(|window| (window.kind, window.remaining(now_unix_ms)))
            .min_by_key(|(_, wait)| *wait)
            .map_or(BudgetDecision::Granted, |(window, wait)| {
                BudgetDecision::Exhausted { window, wait }
            })
    }

    /// Same as [`RateBudget::check_at`], but a grant spends one call in both
    /// windows.
    pub fn try_acquire_at(&mut self, now_unix_ms: u64) -> BudgetDecision {
        let decision = self.check_at(now_unix_ms);
        if decision.is_granted() {
            self.short.count = self.short.count.saturating_add(1);
            self.long.count = self.long.count.saturating_add(1);
        }
        decision
    }

    pub fn check(&mut self) -> BudgetDecision {
        self.check_at(current_unix_timestamp_ms())
    }

    pub fn try_acquire(&mut self) -> BudgetDecision {
        self.try_acquire_at(current_unix_timestamp_ms())
    }

    pub fn usage(&self) -> RateBudgetUsage {
        RateBudgetUsage {
            short_count: self.short.count,
            short_limit: self.short.limit,
            long_count: self.long.count,
            long_limit: self.long.limit,
        }
    }
}
