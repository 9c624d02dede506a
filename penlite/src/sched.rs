//! Operation types for the per-instance scheduler.
//!
//! An [`Operation`] is one lifecycle request queued against an instance:
//! a kind, a deadline, a cancellation token, and a ULID id for log
//! correlation. Queues are per-instance and strictly ordered; the worker
//! in `controller::worker` guarantees at most one in-flight operation per
//! instance.

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::PenliteResult;
use crate::instance::InstanceStatus;

/// Lifecycle operation kinds accepted by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Start the instance (creating it natively first if never created).
    Start,
    /// Stop the instance gracefully.
    Stop,
    /// Suspend the instance via the native freezer.
    Freeze,
    /// Resume a frozen instance.
    Unfreeze,
    /// Tear the instance down and remove it.
    Destroy,
}

impl OpKind {
    /// Stable lowercase name, used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Start => "start",
            OpKind::Stop => "stop",
            OpKind::Freeze => "freeze",
            OpKind::Unfreeze => "unfreeze",
            OpKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operation id (ULID) for correlating a submission through logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OpId(String);

impl OpId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({})", self.0)
    }
}

/// One lifecycle request against an instance.
#[derive(Debug, Clone)]
pub struct Operation {
    /// What to do.
    pub kind: OpKind,
    /// Absolute deadline. If it elapses before the operation starts, the
    /// operation fails with `Timeout` without reaching the native layer;
    /// if it elapses mid-call, the caller unblocks while the call is
    /// tracked to completion internally.
    pub deadline: Instant,
    /// Cooperative cancellation: a full no-op before the native call
    /// starts, best-effort (caller unblocks, effect preserved) after.
    pub cancel: CancellationToken,
    /// Correlation id.
    pub id: OpId,
}

impl Operation {
    /// Operation of `kind` due within `timeout` from now.
    pub fn new(kind: OpKind, timeout: Duration) -> Self {
        Self {
            kind,
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
            id: OpId::new(),
        }
    }

    /// Replace the cancellation token (to share one across submissions).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Work delivered to an instance worker through its queue.
pub(crate) enum WorkItem {
    /// A caller-submitted operation with its reply channel. The reply
    /// may be dropped (caller unblocked by deadline or cancellation);
    /// the worker still tracks the operation to completion.
    Op {
        op: Operation,
        reply: oneshot::Sender<PenliteResult<InstanceStatus>>,
    },
    /// Reconciler probe; only enqueued when the instance is idle.
    Reconcile,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_ids_are_unique_ulids() {
        let a = OpId::new();
        let b = OpId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
    }

    #[test]
    fn operation_deadline_is_in_the_future() {
        let op = Operation::new(OpKind::Start, Duration::from_secs(5));
        assert!(op.deadline > Instant::now());
        assert!(!op.cancel.is_cancelled());
    }
}
