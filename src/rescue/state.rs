//! Session state, failure counter and processing guard

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Automation status as seen by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Idle,
    /// Endpoint not allow-listed and override not confirmed
    UntrustedPending,
    /// Session exists, automation not running
    Armed,
    /// Scheduler ticking, nothing in flight
    Monitoring,
    /// One executor call outstanding
    Executing,
    /// Both legs landed, wipe pending
    Succeeded,
    /// Last poll or execution failed
    Failed,
    /// Failure limit reached, run stopped
    Halted,
}

impl SessionState {
    /// Whether the polling scheduler is live in this state
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SessionState::Monitoring | SessionState::Executing | SessionState::Failed
        )
    }

    /// Listed transitions; everything else is a conflict
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, to),
            (Idle, UntrustedPending)
                | (UntrustedPending, Idle)
                | (Idle, Armed)
                | (Armed, Monitoring)
                | (Armed, Idle)
                | (Monitoring, Monitoring)
                | (Monitoring, Executing)
                | (Monitoring, Failed)
                | (Monitoring, Halted)
                | (Monitoring, Armed)
                | (Monitoring, Idle)
                | (Executing, Succeeded)
                | (Executing, Failed)
                | (Failed, Monitoring)
                | (Failed, Halted)
                | (Succeeded, Idle)
                | (Halted, Monitoring)
                | (Halted, Armed)
                | (Halted, Idle)
        )
    }

    /// Move to `to`, or fail with `StateConflict`
    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(Error::StateConflict(format!(
                "cannot go from {} to {}",
                self, to
            )));
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::UntrustedPending => "untrusted-pending",
            SessionState::Armed => "armed",
            SessionState::Monitoring => "monitoring",
            SessionState::Executing => "executing",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// Consecutive failures, saturating at the configured maximum
#[derive(Debug, Clone)]
pub struct FailureCounter {
    count: u32,
    max: u32,
}

impl FailureCounter {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    /// Record a failure and return the new count
    pub fn record_failure(&mut self) -> u32 {
        self.count = (self.count + 1).min(self.max);
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max
    }
}

/// Exclusivity flag for executor invocations
///
/// Held through a [`GuardToken`]; dropping the token releases the guard,
/// including when the future holding it is dropped mid-flight.
#[derive(Debug, Clone, Default)]
pub struct ProcessingGuard {
    busy: Arc<AtomicBool>,
}

impl ProcessingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard unless it is already held
    pub fn try_acquire(&self) -> Option<GuardToken> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardToken {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof that the processing guard is held
#[derive(Debug)]
pub struct GuardToken {
    busy: Arc<AtomicBool>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
