//! # Reconnection Supervisor
//!
//! Connection state and the policy deciding when to try again.
//!
//! ## State Machine
//! ```text
//!   Disconnected ──start()──► Connecting ──► Authenticating ──► Subscribing ──► Synced
//!        ▲                        ▲               │                  │            │
//!        │ auth rejected,         │               │ transport lost   │            │
//!        │ retries exhausted,     │               ▼                  ▼            ▼
//!        │ stop()                 └─backoff── Reconnecting ◄────────────────────────┘
//!        └──────────────────────────────────────────┘
//! ```
//!
//! The entity store is never cleared here. While not `Synced`, its contents
//! are last-known values and consumers mark them stale from the state alone.

use std::fmt;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SyncSettings;

// =============================================================================
// Connection State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    /// Mirror is live; commands are accepted.
    Synced,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
}

impl ConnectionState {
    pub fn is_synced(&self) -> bool {
        matches!(self, ConnectionState::Synced)
    }

    /// Store contents are last-known values, not live ones.
    pub fn is_stale(&self) -> bool {
        !self.is_synced()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Synced => "synced",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Reconnect Policy
// =============================================================================

/// Outcome of one connection attempt, as seen by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Never reached `Synced`.
    Failed,
    /// Was `Synced` for this long before the connection dropped.
    Dropped { synced_for: Duration },
}

pub struct ReconnectPolicy {
    backoff: ExponentialBackoff,
    max_interval: Duration,
    stability_threshold: Duration,
    max_retries: u32,
    failures: u32,
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("current_interval", &self.backoff.current_interval)
            .field("max_interval", &self.max_interval)
            .field("stability_threshold", &self.stability_threshold)
            .field("max_retries", &self.max_retries)
            .field("failures", &self.failures)
            .finish()
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            settings.initial_backoff(),
            settings.max_backoff(),
            settings.backoff_multiplier,
            settings.backoff_jitter,
        )
        .with_stability_threshold(settings.stability_threshold())
        .with_max_retries(settings.max_retries)
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_max_interval(max)
            .with_multiplier(multiplier)
            .with_randomization_factor(jitter)
            .with_max_elapsed_time(None)
            .build();

        Self {
            backoff,
            max_interval: max,
            stability_threshold: Duration::from_secs(10),
            max_retries: 0,
            failures: 0,
        }
    }

    pub fn with_stability_threshold(mut self, threshold: Duration) -> Self {
        self.stability_threshold = threshold;
        self
    }

    /// 0 retries forever.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Consecutive attempts that ended before `Synced`.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records how a session ended and returns the delay before the next
    /// attempt, or `None` when the retry budget is spent.
    pub fn next_delay(&mut self, end: SessionEnd) -> Option<Duration> {
        match end {
            SessionEnd::Dropped { synced_for } => {
                self.failures = 0;
                if synced_for >= self.stability_threshold {
                    debug!(?synced_for, "Session was stable, resetting backoff");
                    self.backoff.reset();
                }
            }
            SessionEnd::Failed => {
                self.failures += 1;
                if self.max_retries > 0 && self.failures >= self.max_retries {
                    info!(
                        failures = self.failures,
                        max_retries = self.max_retries,
                        "Max reconnection attempts reached"
                    );
                    return None;
                }
            }
        }

        let delay = self.backoff.next_backoff().unwrap_or(self.max_interval);
        debug!(?delay, failures = self.failures, "Scheduling reconnect");
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, 0.0)
            .with_stability_threshold(Duration::from_secs(10))
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Synced.to_string(), "synced");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert!(ConnectionState::Subscribing.is_stale());
        assert!(!ConnectionState::Synced.is_stale());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut policy = policy();
        let delays: Vec<u64> = (0..7)
            .map(|_| policy.next_delay(SessionEnd::Failed).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_stable_session_resets_backoff() {
        let mut policy = policy();
        for _ in 0..4 {
            policy.next_delay(SessionEnd::Failed);
        }

        let short = policy
            .next_delay(SessionEnd::Dropped { synced_for: Duration::from_secs(2) })
            .unwrap();
        assert_eq!(short, Duration::from_secs(16));
        assert_eq!(policy.failures(), 0);

        let stable = policy
            .next_delay(SessionEnd::Dropped { synced_for: Duration::from_secs(60) })
            .unwrap();
        assert_eq!(stable, Duration::from_secs(1));
    }

    #[test]
    fn test_max_retries() {
        let mut policy = policy().with_max_retries(3);
        assert!(policy.next_delay(SessionEnd::Failed).is_some());
        assert!(policy.next_delay(SessionEnd::Failed).is_some());
        assert!(policy.next_delay(SessionEnd::Failed).is_none());
    }

    #[test]
    fn test_from_settings() {
        let settings = SyncSettings::default();
        let mut policy = ReconnectPolicy::from_settings(&settings);
        assert_eq!(policy.next_delay(SessionEnd::Failed), Some(Duration::from_secs(1)));
    }
}
