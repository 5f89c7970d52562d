//! Per-host circuit breaker.
//!
//! # States
//! - Closed: requests pass through
//! - Open: the host recently failed `failure_threshold` times in a row; requests
//!   fail fast with [`SshCoreError::CircuitOpen`] until the cool-down elapses
//! - Half-Open: implicit. The first request after the cool-down is let through
//!   as a probe; others keep failing fast while it runs
//!
//! ```text
//! Closed    -> Open      : failure_count >= threshold
//! Open      -> Half-Open : now - opened_at >= cooldown
//! Half-Open -> Closed    : probe succeeds (failure_count = 0)
//! Half-Open -> Open      : probe fails (opened_at refreshed)
//! ```
//!
//! A probe that never reports back (its task was cancelled) is abandoned after
//! another cool-down and the next caller becomes the probe.

use std::time::Duration;

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::config::CircuitConfig;
use super::error::{Result, SshCoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot returned by `GetCircuitStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CircuitStatus {
    pub host: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Seconds until a probe is allowed (0 unless OPEN)
    pub cooldown_remaining_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            failure_count: 0,
            opened_at: None,
            probe_started: None,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn state(&self, now: Instant) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened) if now.saturating_duration_since(opened) < self.config.cooldown => {
                CircuitState::Open
            }
            Some(_) => CircuitState::HalfOpen,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|opened| {
                self.config
                    .cooldown
                    .saturating_sub(now.saturating_duration_since(opened))
            })
            .unwrap_or_default()
    }

    fn probe_in_flight(&self, now: Instant) -> bool {
        self.probe_started
            .is_some_and(|started| now.saturating_duration_since(started) < self.config.cooldown)
    }

    /// Whether a request may proceed. Pure read.
    ///
    /// `Err` carries the remaining cool-down (zero while a half-open probe is
    /// in flight).
    pub fn can_execute(&self, now: Instant) -> std::result::Result<(), Duration> {
        match self.state(now) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(self.remaining(now)),
            CircuitState::HalfOpen if self.probe_in_flight(now) => Err(Duration::ZERO),
            CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Like [`can_execute`](Self::can_execute), but claims the half-open probe
    /// slot when the request is let through as a probe.
    pub fn acquire(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.can_execute(now)?;
        if self.state(now) == CircuitState::HalfOpen {
            self.probe_started = Some(now);
        }
        Ok(())
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.opened_at = None;
        self.probe_started = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.probe_started = None;
        if self.opened_at.is_some() || self.failure_count >= self.config.failure_threshold {
            self.opened_at = Some(now);
        }
    }

    pub fn reset(&mut self) {
        self.record_success();
    }

    pub fn status(&self, host: &str, now: Instant) -> CircuitStatus {
        let state = self.state(now);
        CircuitStatus {
            host: host.to_string(),
            state,
            failure_count: self.failure_count,
            cooldown_remaining_secs: match state {
                CircuitState::Open => self.remaining(now).as_secs(),
                _ => 0,
            },
        }
    }
}

/// Breakers keyed by host, created lazily on first use.
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Gate a request to `host`, failing fast with `CircuitOpen`.
    pub fn acquire(&self, host: &str) -> Result<()> {
        let now = Instant::now();
        let mut breaker = self
            .breakers
            .entry(host.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        breaker
            .acquire(now)
            .map_err(|remaining| SshCoreError::CircuitOpen {
                host: host.to_string(),
                remaining,
            })
    }

    /// Pure check, does not claim the probe slot.
    pub fn can_execute(&self, host: &str) -> bool {
        self.breakers
            .get(host)
            .is_none_or(|b| b.can_execute(Instant::now()).is_ok())
    }

    /// A closed breaker with no failures carries no state, so it is dropped.
    pub fn record_success(&self, host: &str) {
        if let Some((_, breaker)) = self.breakers.remove(host)
            && breaker.state(Instant::now()) != CircuitState::Closed
        {
            info!("Circuit for {} closed after successful probe", host);
        }
    }

    pub fn record_failure(&self, host: &str) {
        let now = Instant::now();
        let mut breaker = self
            .breakers
            .entry(host.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        let was_open = breaker.state(now) != CircuitState::Closed;
        breaker.record_failure(now);
        if !was_open && breaker.state(now) == CircuitState::Open {
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                host,
                breaker.failure_count()
            );
        }
    }

    pub fn status(&self, host: &str) -> CircuitStatus {
        let now = Instant::now();
        match self.breakers.get(host) {
            Some(breaker) => breaker.status(host, now),
            None => CircuitBreaker::new(self.config).status(host, now),
        }
    }

    /// Operator override: close the circuit and clear the failure count.
    pub fn reset(&self, host: &str) -> bool {
        match self.breakers.get_mut(host) {
            Some(mut breaker) => {
                breaker.reset();
                info!("Circuit for {} manually reset", host);
                true
            }
            None => false,
        }
    }
}
