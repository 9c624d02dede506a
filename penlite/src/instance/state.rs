//! Instance lifecycle status and state machine.
//!
//! Defines the possible states of an instance and the valid transitions
//! between them. This is the single authority on state: the per-instance
//! worker applies operations through [`InstanceState::transition_to`], and
//! invalid requests fail without changing recorded state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{PenliteError, PenliteResult};

/// Lifecycle status of an instance.
///
/// State machine (initial: Defined, terminal: Destroyed):
/// ```text
/// define()  → Defined (persisted, nothing native yet)
/// start()   → Starting → Running          (create+start natively)
/// stop()    → Stopping → Stopped
/// freeze()  → Frozen   (running instance suspended by the native freezer)
/// destroy() → Destroying → Destroyed      (native config removed)
/// ```
///
/// `Error` means the native layer left the instance in an unknown
/// condition; the machine never auto-retries out of it. The only way
/// forward is destroy-and-recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Declared and persisted; no native resources allocated yet.
    Defined,

    /// Start operation in flight (transient).
    Starting,

    /// Instance is running.
    Running,

    /// Stop operation in flight (transient).
    Stopping,

    /// Not running; native config preserved, can be restarted.
    Stopped,

    /// Suspended by the native freezer; resumable via unfreeze.
    Frozen,

    /// Native layer failed; manual destroy-and-recreate required.
    Error,

    /// Destroy operation in flight (transient).
    Destroying,

    /// Terminal: native resources released, instance removed.
    Destroyed,
}

impl InstanceStatus {
    /// True for states with a live native-side process to supervise.
    pub fn is_supervised(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Running | InstanceStatus::Frozen | InstanceStatus::Stopping
        )
    }

    /// True for in-flight operation states.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Stopping | InstanceStatus::Destroying
        )
    }

    /// Check if start() can be requested from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, InstanceStatus::Defined | InstanceStatus::Stopped)
    }

    /// Check if stop() can be requested from this state.
    /// Frozen instances may be stopped; the native layer kills them.
    pub fn can_stop(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Frozen)
    }

    /// Check if freeze() can be requested from this state.
    pub fn can_freeze(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }

    /// Check if unfreeze() can be requested from this state.
    pub fn can_unfreeze(&self) -> bool {
        matches!(self, InstanceStatus::Frozen)
    }

    /// Check if destroy() can be requested from this state.
    ///
    /// Destroy is accepted from every state except an already in-flight
    /// destroy. Destroy on Destroyed is handled as an idempotent no-op
    /// before validation, so it never reaches the machine.
    pub fn can_destroy(&self) -> bool {
        !matches!(self, InstanceStatus::Destroying | InstanceStatus::Destroyed)
    }

    /// Check if a transition to `target` is valid.
    pub fn can_transition_to(&self, target: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, target),
            // Start path
            (Defined, Starting) |
            (Stopped, Starting) |
            (Starting, Running) |
            (Starting, Error) |
            // Stop path; Running → Stopped is the reconciler's
            // unexpected-exit edge
            (Running, Stopping) |
            (Running, Stopped) |
            (Stopping, Stopped) |
            (Stopping, Error) |
            // Freezer
            (Running, Frozen) |
            (Frozen, Running) |
            (Frozen, Stopping) |
            (Frozen, Stopped) |
            (Frozen, Error) |
            (Running, Error) |
            // Destroy is reachable from every non-terminal state
            (Defined, Destroying) |
            (Starting, Destroying) |
            (Running, Destroying) |
            (Stopping, Destroying) |
            (Stopped, Destroying) |
            (Frozen, Destroying) |
            (Error, Destroying) |
            (Destroying, Destroyed) |
            (Destroying, Error)
        )
    }

    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Defined => "defined",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Frozen => "frozen",
            InstanceStatus::Error => "error",
            InstanceStatus::Destroying => "destroying",
            InstanceStatus::Destroyed => "destroyed",
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "defined" => Ok(InstanceStatus::Defined),
            "starting" => Ok(InstanceStatus::Starting),
            "running" => Ok(InstanceStatus::Running),
            "stopping" => Ok(InstanceStatus::Stopping),
            "stopped" => Ok(InstanceStatus::Stopped),
            "frozen" => Ok(InstanceStatus::Frozen),
            "error" => Ok(InstanceStatus::Error),
            "destroying" => Ok(InstanceStatus::Destroying),
            "destroyed" => Ok(InstanceStatus::Destroyed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dynamic instance state (changes during lifecycle).
///
/// Updated by the instance worker on every committed transition and
/// persisted write-through. Carries the last classified error so callers
/// inspecting an `Error` instance can see what put it there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Last state change timestamp (UTC).
    pub last_updated: DateTime<Utc>,
    /// Human-readable detail of the failure that led to `Error`, if any.
    pub last_error: Option<String>,
}

impl InstanceState {
    /// Create initial state for a newly defined instance.
    pub fn new() -> Self {
        Self {
            status: InstanceStatus::Defined,
            last_updated: Utc::now(),
            last_error: None,
        }
    }

    /// Create state restored from the persistent store.
    pub fn restored(status: InstanceStatus) -> Self {
        Self {
            status,
            last_updated: Utc::now(),
            last_error: None,
        }
    }

    /// Attempt a state transition with validation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` (recorded state unchanged) if the
    /// transition is not in the machine.
    pub fn transition_to(&mut self, target: InstanceStatus) -> PenliteResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(PenliteError::InvalidTransition(format!(
                "cannot transition from {} to {}",
                self.status, target
            )));
        }
        self.status = target;
        self.last_updated = Utc::now();
        if target != InstanceStatus::Error {
            self.last_error = None;
        }
        Ok(())
    }

    /// Transition into `Error`, recording the cause.
    ///
    /// Not validated: an instance whose native layer failed is in `Error`
    /// regardless of where the machine thought it was.
    pub fn fail(&mut self, detail: impl Into<String>) {
        self.status = InstanceStatus::Error;
        self.last_updated = Utc::now();
        self.last_error = Some(detail.into());
    }

    /// Force a status without validation (restart adoption only).
    pub fn force_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.last_updated = Utc::now();
    }
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}
