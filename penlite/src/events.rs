//! State-change notifications.
//!
//! Every committed transition is broadcast so consumers (API layers,
//! supervisors) observe lifecycle changes without polling. Delivery is
//! best-effort fan-out: a slow subscriber lags and may miss events, the
//! controller never blocks on one.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::instance::{InstanceName, InstanceStatus};
use crate::sched::OpKind;

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// A submitted operation drove the transition.
    Operation(OpKind),
    /// The reconciler caught an out-of-band native-side change.
    Reconciled,
}

/// One committed state transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Instance that changed.
    pub instance: InstanceName,
    /// Status before the transition.
    pub from: InstanceStatus,
    /// Status after the transition.
    pub to: InstanceStatus,
    /// What drove it.
    pub reason: ChangeReason,
    /// When it was committed (UTC).
    pub at: DateTime<Utc>,
}

/// Broadcast hub for state changes.
#[derive(Clone)]
pub(crate) struct EventHub {
    tx: broadcast::Sender<StateChange>,
}

impl EventHub {
    /// Hub retaining up to `capacity` undelivered events per subscriber.
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }

    /// Emit a committed transition. No subscribers is not an error.
    pub(crate) fn emit(
        &self,
        instance: &InstanceName,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: ChangeReason,
    ) {
        let event = StateChange {
            instance: instance.clone(),
            from,
            to,
            reason,
            at: Utc::now(),
        };
        tracing::debug!(
            instance = %event.instance,
            from = %event.from,
            to = %event.to,
            reason = ?event.reason,
            "state change"
        );
        let _ = self.tx.send(event);
    }
}
