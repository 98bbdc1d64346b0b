//! Per-tool failure counter with closed/open/half-open transitions (§4.9).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::DenyReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct ToolState {
    state: State,
    consecutive_failures: u64,
    opened_at: Option<DateTime<Utc>>,
}

impl Default for ToolState {
    fn default() -> Self {
        Self { state: State::Closed, consecutive_failures: 0, opened_at: None }
    }
}

pub struct CircuitBreaker {
    threshold: u64,
    cooldown_seconds: u64,
    tools: Arc<DashMap<String, ToolState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u64, cooldown_seconds: u64) -> Self {
        Self { threshold, cooldown_seconds, tools: Arc::new(DashMap::new()) }
    }

    /// Threshold = 0 disables the breaker for that tool.
    pub fn check(&self, tool: &str, now: DateTime<Utc>) -> Result<(), DenyReason> {
        if self.threshold == 0 {
            return Ok(());
        }
        let mut entry = self.tools.entry(tool.to_string()).or_insert_with(ToolState::default);
        match entry.state {
            State::Closed => Ok(()),
            State::Open => {
                let opened_at = entry.opened_at.unwrap_or(now);
                if (now - opened_at).num_seconds() as u64 >= self.cooldown_seconds {
                    entry.state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(DenyReason::CircuitOpen)
                }
            }
            State::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self, tool: &str) {
        if self.threshold == 0 {
            return;
        }
        let mut entry = self.tools.entry(tool.to_string()).or_insert_with(ToolState::default);
        entry.state = State::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
    }

    pub fn record_failure(&self, tool: &str, now: DateTime<Utc>) {
        if self.threshold == 0 {
            return;
        }
        let mut entry = self.tools.entry(tool.to_string()).or_insert_with(ToolState::default);
        match entry.state {
            State::HalfOpen => {
                entry.state = State::Open;
                entry.opened_at = Some(now);
            }
            State::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.threshold {
                    entry.state = State::Open;
                    entry.opened_at = Some(now);
                }
            }
            State::Open => {}
        }
    }

    /// Current state as a gauge value: 0=closed, 1=open, 2=half-open.
    pub fn state_value(&self, tool: &str) -> f64 {
        match self.tools.get(tool).map(|e| e.state) {
            Some(State::Open) => 1.0,
            Some(State::HalfOpen) => 2.0,
            _ => 0.0,
        }
    }
}
