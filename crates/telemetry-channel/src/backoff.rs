// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry cadence per destination.
//!
//! Every destination owns one [`BackoffPolicy`]. Deliveries to the same
//! destination share its failure count and its "not before" gate, so a
//! failing endpoint sees a single exponential schedule no matter how many
//! transmissions are waiting on it.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ChannelError;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// Gate used when a delay does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.base_delay.is_zero() {
            return Err(ChannelError::InvalidConfig(
                "backoff base delay must be greater than 0".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ChannelError::InvalidConfig(format!(
                "backoff max delay {:?} is smaller than base delay {:?}",
                self.max_delay, self.base_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ChannelError::InvalidConfig(format!(
                "backoff jitter fraction must be within [0, 1], got {}",
                self.jitter_fraction
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPhase {
    Idle,
    Backoff(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    pub consecutive_failures: u32,
    pub current_delay: Duration,
}

impl BackoffState {
    #[must_use]
    pub fn phase(&self) -> BackoffPhase {
        match self.consecutive_failures {
            0 => BackoffPhase::Idle,
            n => BackoffPhase::Backoff(n),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: BackoffState,
    next_attempt_at: Option<Instant>,
}

#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    inner: Mutex<Inner>,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        BackoffPolicy {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Delay before jitter after `failures` consecutive failures:
    /// `min(max_delay, base_delay * 2^(failures - 1))`.
    #[must_use]
    pub fn computed_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.config
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_delay)
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state.consecutive_failures > 0 {
            debug!(
                "CHANNEL | Destination recovered after {} consecutive failures",
                inner.state.consecutive_failures
            );
        }
        *inner = Inner::default();
    }

    /// Records a retryable failure and returns the delay before the next
    /// attempt. A server-specified delay acts as a floor.
    pub fn on_failure(&self, server_delay: Option<Duration>) -> Duration {
        let mut inner = self.lock();
        let failures = inner.state.consecutive_failures.saturating_add(1);
        let computed = self.computed_delay(failures);
        let mut delay = computed.saturating_add(jitter(computed, self.config.jitter_fraction));
        if let Some(server_delay) = server_delay {
            delay = delay.max(server_delay);
        }

        inner.state = BackoffState {
            consecutive_failures: failures,
            current_delay: delay,
        };
        let now = Instant::now();
        let candidate = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        inner.next_attempt_at = Some(match inner.next_attempt_at {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
        delay
    }

    /// Time left before the destination accepts another attempt.
    #[must_use]
    pub fn ready_in(&self) -> Duration {
        self.lock()
            .next_attempt_at
            .map_or(Duration::ZERO, |at| {
                at.saturating_duration_since(Instant::now())
            })
    }

    #[must_use]
    pub fn state(&self) -> BackoffState {
        self.lock().state
    }

    #[must_use]
    pub fn phase(&self) -> BackoffPhase {
        self.state().phase()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn jitter(delay: Duration, fraction: f64) -> Duration {
    let bound = delay.as_secs_f64() * fraction;
    if bound <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::rng().random_range(0.0..bound))
}

/// One [`BackoffPolicy`] per destination, created on first use.
#[derive(Debug)]
pub struct BackoffRegistry {
    config: BackoffConfig,
    policies: Mutex<HashMap<String, Arc<BackoffPolicy>>>,
}

impl BackoffRegistry {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        BackoffRegistry {
            config,
            policies: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_destination(&self, destination: &str) -> Arc<BackoffPolicy> {
        let mut policies = self
            .policies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            policies
                .entry(destination.to_string())
                .or_insert_with(|| Arc::new(BackoffPolicy::new(self.config))),
        )
    }

    /// State of a destination, `None` when nothing was ever sent there.
    pub fn state(&self, destination: &str) -> Option<BackoffState> {
        self.policies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .map(|policy| policy.state())
    }
}
