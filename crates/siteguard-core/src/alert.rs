//! Alert debouncing.
//!
//! One [`AlertController`] exists per running pipeline. The producer calls
//! [`AlertController::evaluate`] once per frame; readers (status endpoint,
//! annotator) only observe the banner window and phase.

use crate::types::ComplianceTally;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);
pub const DEFAULT_BANNER: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    /// Minimum time between two triggers.
    pub cooldown: Duration,
    /// How long the "alert sent" banner stays visible after a trigger.
    pub banner: Duration,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            banner: DEFAULT_BANNER,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertState {
    pub last_alert: Option<Instant>,
    pub banner_expiry: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPhase {
    Monitoring,
    Cooldown,
}

/// Outcome of evaluating one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    /// No violation in this frame.
    Idle,
    /// Violation present but the cooldown window is still open.
    Suppressed { remaining: Duration },
    /// Violation present and a notification must be sent now.
    Trigger { at: Instant },
}

impl AlertDecision {
    pub fn is_trigger(&self) -> bool {
        matches!(self, AlertDecision::Trigger { .. })
    }
}

#[derive(Debug, Default)]
pub struct AlertController {
    policy: AlertPolicy,
    state: Mutex<AlertState>,
}

impl AlertController {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn policy(&self) -> AlertPolicy {
        self.policy
    }

    /// Decide whether `tally`, observed at `now`, triggers a notification.
    ///
    /// The check and the state update happen under one lock, so a trigger
    /// is never emitted twice for the same window.
    pub fn evaluate(&self, tally: &ComplianceTally, now: Instant) -> AlertDecision {
        if !tally.is_violation() {
            return AlertDecision::Idle;
        }

        let mut state = self.lock();
        if let Some(last) = state.last_alert {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.policy.cooldown {
                return AlertDecision::Suppressed {
                    remaining: self.policy.cooldown - elapsed,
                };
            }
        }

        // last_alert never moves backwards.
        let at = state.last_alert.map_or(now, |last| last.max(now));
        state.last_alert = Some(at);
        state.banner_expiry = Some(at + self.policy.banner);
        AlertDecision::Trigger { at }
    }

    pub fn phase(&self, now: Instant) -> AlertPhase {
        match self.lock().last_alert {
            Some(last) if now.saturating_duration_since(last) < self.policy.cooldown => {
                AlertPhase::Cooldown
            }
            _ => AlertPhase::Monitoring,
        }
    }

    pub fn banner_active(&self, now: Instant) -> bool {
        self.lock().banner_expiry.is_some_and(|expiry| now < expiry)
    }

    pub fn snapshot(&self) -> AlertState {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
