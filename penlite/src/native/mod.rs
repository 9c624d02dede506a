//! Native runtime boundary.
//!
//! The controller never touches the native container layer directly; it
//! goes through the [`NativeRuntime`] / [`NativeHandle`] traits so the
//! whole lifecycle logic can run against a mock with no host dependency.
//! The shipped backend ([`LxcCommandRuntime`]) drives the host `lxc-*`
//! tools as subprocesses.
//!
//! Every method here is **blocking**: callers must dispatch through
//! `tokio::task::spawn_blocking` (the instance worker does) so one slow
//! native call cannot stall the coordination path.

mod handle;
mod lxc;

pub use handle::HandleGuard;
pub use lxc::LxcCommandRuntime;

use std::fmt;

use crate::errors::PenliteResult;
use crate::options::InstanceConfig;

/// Operations the controller can ask the native layer to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    /// Materialize the instance natively (config parsing, rootfs setup).
    Create,
    /// Start the instance's payload.
    Start,
    /// Stop the instance (graceful, then forced by the native layer).
    Stop,
    /// Suspend via the native freezer.
    Freeze,
    /// Resume from the native freezer.
    Unfreeze,
    /// Remove the instance and all its native resources.
    Destroy,
}

impl NativeOp {
    /// Stable lowercase name, used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeOp::Create => "create",
            NativeOp::Start => "start",
            NativeOp::Stop => "stop",
            NativeOp::Freeze => "freeze",
            NativeOp::Unfreeze => "unfreeze",
            NativeOp::Destroy => "destroy",
        }
    }
}

impl fmt::Display for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a native invocation: a status code plus optional detail.
///
/// Code 0 is success, anything else failure. Never discarded: the instance
/// worker maps every status to either a state transition or a surfaced
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeStatus {
    /// Status code returned by the native layer (0 = success).
    pub code: i32,
    /// Optional error detail (e.g. captured stderr).
    pub detail: Option<String>,
}

impl NativeStatus {
    /// Successful status.
    pub fn ok() -> Self {
        Self {
            code: 0,
            detail: None,
        }
    }

    /// Failure status with a detail message.
    pub fn failed(code: i32, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    /// True if the native layer reported success.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Instance state as reported by the native layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    /// Payload process is running.
    Running,
    /// Suspended by the native freezer.
    Frozen,
    /// Exists natively but is not running.
    Stopped,
    /// The native layer has no record of this instance.
    Missing,
}

/// One instance's session with the native layer.
///
/// A handle owns native-side resources from `open` until `close`. All
/// calls are blocking and may take arbitrarily long; none are safely
/// preemptible. A handle that failed a call is in an indeterminate native
/// state — [`HandleGuard`] enforces that it is never reused.
pub trait NativeHandle: Send {
    /// Perform a lifecycle operation, returning its native status.
    fn invoke(&mut self, op: NativeOp) -> NativeStatus;

    /// Query the actual native-side state of the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the query itself could not be performed (as
    /// opposed to the instance merely being stopped or missing).
    fn observe(&mut self) -> PenliteResult<ObservedState>;

    /// Release native-side resources. Called exactly once, by
    /// [`HandleGuard`].
    fn close(&mut self);
}

/// Factory for native sessions.
///
/// `open` acquires native-side resources (config parsing, per-instance
/// bookkeeping) and must roll back anything partially acquired if it
/// fails; the controller pairs every successful open with a guaranteed
/// close via [`HandleGuard`].
pub trait NativeRuntime: Send + Sync {
    /// Open a session for `name` with its declared configuration.
    fn open(&self, name: &str, config: &InstanceConfig) -> PenliteResult<Box<dyn NativeHandle>>;
}
