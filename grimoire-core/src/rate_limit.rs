//! Per-key point-bucket rate limiting.
//!
//! The first `consume` for a key opens a window of `window_seconds` holding
//! `points`. Consuming past the budget is denied and, with a non-zero
//! `block_seconds`, blocks the key for that long. Once the window or the
//! block runs out, the key starts over with a full budget.

use crate::clock::{Clock, SystemClock};
use crate::error::GrimoireError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Limiter category used for generation requests.
pub const GENERATION: &str = "generation";
/// Limiter category used for code-execution requests.
pub const CODE_EXECUTION: &str = "code_execution";

/// Budget of a single limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub points: u32,
    pub window_seconds: u64,
    #[serde(default)]
    pub block_seconds: u64,
}

impl RateLimitConfig {
    pub fn new(points: u32, window_seconds: u64) -> Self {
        Self {
            points,
            window_seconds,
            block_seconds: 0,
        }
    }

    pub fn with_block_seconds(mut self, block_seconds: u64) -> Self {
        self.block_seconds = block_seconds;
        self
    }

    /// Reject spans longer than [`MAX_SPAN_SECONDS`].
    pub fn validate(&self) -> Result<(), GrimoireError> {
        for (field, value) in [
            ("window_seconds", self.window_seconds),
            ("block_seconds", self.block_seconds),
        ] {
            if value > MAX_SPAN_SECONDS {
                return Err(GrimoireError::configuration(format!(
                    "{field} = {value} exceeds the maximum of {MAX_SPAN_SECONDS}"
                )));
            }
        }
        Ok(())
    }
}

/// Longest window or block accepted from configuration (100 years).
pub const MAX_SPAN_SECONDS: u64 = 100 * 365 * 24 * 3600;

fn span(seconds: u64) -> Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

fn after(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    now.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Outcome of a [`RateLimiter::consume`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct KeyState {
    consumed: u32,
    window_ends: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

impl KeyState {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            consumed: 0,
            window_ends: after(now, window),
            blocked_until: None,
        }
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        match self.blocked_until {
            Some(until) => now >= until,
            None => now >= self.window_ends,
        }
    }
}

/// Admission control for one endpoint category.
///
/// Each key's state sits behind its map shard's lock for the whole
/// read-modify-write, so concurrent consumes never lose an update.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    states: DashMap<String, KeyState>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            states: DashMap::new(),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Spend one point for `key`.
    pub fn consume(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let window = span(self.config.window_seconds);

        let mut entry = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| KeyState::fresh(now, window));
        let state = entry.value_mut();

        if let Some(until) = state.blocked_until {
            if now < until {
                return RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at: until,
                };
            }
        }
        if state.expired(now) {
            *state = KeyState::fresh(now, window);
        }

        if state.consumed < self.config.points {
            state.consumed += 1;
            return RateLimitDecision {
                allowed: true,
                remaining: self.config.points - state.consumed,
                reset_at: state.window_ends,
            };
        }

        let reset_at = if self.config.block_seconds > 0 {
            let until = after(now, span(self.config.block_seconds));
            state.blocked_until = Some(until);
            until
        } else {
            state.window_ends
        };

        tracing::debug!(limiter = %self.name, key, %reset_at, "rate limit exceeded");
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at,
        }
    }

    /// Spend one point, turning a denial into [`GrimoireError::RateLimitExceeded`].
    pub fn check(&self, key: &str) -> Result<RateLimitDecision, GrimoireError> {
        let decision = self.consume(key);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(GrimoireError::RateLimitExceeded {
                limiter: self.name.clone(),
                key: key.to_string(),
                reset_at: decision.reset_at,
            })
        }
    }

    /// Forget everything about `key`.
    pub fn reset(&self, key: &str) {
        self.states.remove(key);
    }

    /// Drop keys whose window and block have both run out.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.states.len();
        self.states.retain(|_, state| !state.expired(now));
        before - self.states.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }
}

/// Independent limiters keyed by category name.
#[derive(Debug, Default, Clone)]
pub struct RateLimiters {
    limiters: HashMap<String, Arc<RateLimiter>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one limiter per entry of `configs`.
    pub fn from_configs(configs: &HashMap<String, RateLimitConfig>, clock: Arc<dyn Clock>) -> Self {
        let limiters = configs
            .iter()
            .map(|(name, config)| {
                let limiter = RateLimiter::with_clock(name.clone(), config.clone(), clock.clone());
                (name.clone(), Arc::new(limiter))
            })
            .collect();
        Self { limiters }
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiters
            .insert(limiter.name().to_string(), Arc::new(limiter));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RateLimiter>> {
        self.limiters.get(name)
    }

    /// Spend a point on the `name` limiter. Categories without a limiter are
    /// not admission-controlled.
    pub fn check(&self, name: &str, key: &str) -> Result<Option<RateLimitDecision>, GrimoireError> {
        match self.limiters.get(name) {
            Some(limiter) => limiter.check(key).map(Some),
            None => Ok(None),
        }
    }

    pub fn prune(&self) -> usize {
        self.limiters.values().map(|l| l.prune()).sum()
    }
}
