//! Per-instance worker: the single mutator of an instance's state.
//!
//! Each registered instance gets one worker task owning its operation
//! queue and its native handle. Operations and reconcile probes flow
//! through the same queue, so state transitions, native calls, and
//! reconciliation are mutually exclusive per instance by construction —
//! no lock is needed around transitions, and at most one operation is
//! ever in flight.
//!
//! All native calls run under `spawn_blocking` with the handle moved into
//! the closure and back, so a slow native call never stalls the runtime
//! or any other instance.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{PenliteError, PenliteResult};
use crate::events::{ChangeReason, EventHub};
use crate::gate::CapabilityGate;
use crate::instance::InstanceStatus;
use crate::native::{HandleGuard, NativeOp, NativeRuntime, ObservedState};
use crate::registry::InstanceEntry;
use crate::sched::{OpKind, Operation, WorkItem};
use crate::store::InstanceStore;

/// Dependencies shared by all workers of one controller.
pub(crate) struct WorkerContext {
    pub(crate) runtime: Arc<dyn NativeRuntime>,
    pub(crate) gate: CapabilityGate,
    pub(crate) store: Arc<InstanceStore>,
    pub(crate) events: EventHub,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) struct InstanceWorker {
    entry: Arc<InstanceEntry>,
    ctx: Arc<WorkerContext>,
    rx: mpsc::Receiver<WorkItem>,
    handle: Option<HandleGuard>,
}

impl InstanceWorker {
    pub(crate) fn new(
        entry: Arc<InstanceEntry>,
        ctx: Arc<WorkerContext>,
        rx: mpsc::Receiver<WorkItem>,
        handle: Option<HandleGuard>,
    ) -> Self {
        Self {
            entry,
            ctx,
            rx,
            handle,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let item = tokio::select! {
                item = self.rx.recv() => item,
                _ = self.ctx.shutdown.cancelled() => break,
            };
            let Some(item) = item else { break };

            match item {
                WorkItem::Op { op, reply } => self.process_op(op, reply).await,
                WorkItem::Reconcile => self.reconcile().await,
            }
            self.entry.pending.fetch_sub(1, Ordering::SeqCst);
        }

        // Shutdown (or queue closed): release the native session without
        // touching instance state.
        if let Some(guard) = self.handle.take() {
            let _ = tokio::task::spawn_blocking(move || guard.close()).await;
        }
        debug!(instance = %self.entry.name, "instance worker exited");
    }

    async fn process_op(
        &mut self,
        op: Operation,
        reply: oneshot::Sender<PenliteResult<InstanceStatus>>,
    ) {
        let kind = op.kind;
        let from = self.entry.status();

        if kind == OpKind::Destroy {
            self.entry.destroys_waiting.fetch_sub(1, Ordering::SeqCst);
        }

        // Cooperative cancellation before the native call: full no-op.
        if op.cancel.is_cancelled() {
            let _ = reply.send(Err(PenliteError::Cancelled(format!(
                "{} cancelled before start",
                kind
            ))));
            return;
        }

        // A waiting destroy supersedes everything queued before it.
        if kind != OpKind::Destroy && self.entry.destroys_waiting.load(Ordering::SeqCst) > 0 {
            let _ = reply.send(Err(PenliteError::Cancelled(format!(
                "{} superseded by a pending destroy",
                kind
            ))));
            return;
        }

        // Deadline elapsed while queued: fail without reaching the
        // native layer.
        if Instant::now() >= op.deadline {
            let _ = reply.send(Err(PenliteError::Timeout(format!(
                "{} deadline elapsed before start",
                kind
            ))));
            return;
        }

        // Destroy of a destroyed instance is an idempotent no-op.
        if kind == OpKind::Destroy && from == InstanceStatus::Destroyed {
            let _ = reply.send(Ok(InstanceStatus::Destroyed));
            return;
        }

        // Transition validity: enforced here in addition to queue
        // serialization, so a conflicting request fails loudly instead
        // of queuing silently.
        let valid = match kind {
            OpKind::Start => from.can_start(),
            OpKind::Stop => from.can_stop(),
            OpKind::Freeze => from.can_freeze(),
            OpKind::Unfreeze => from.can_unfreeze(),
            OpKind::Destroy => from.can_destroy(),
        };
        if !valid {
            let _ = reply.send(Err(PenliteError::InvalidTransition(format!(
                "cannot {} {} while {}",
                kind, self.entry.name, from
            ))));
            return;
        }

        // Capability gate: once per operation, before any native call.
        // Denial is terminal, never downgraded.
        if let Err(e) = self.ctx.gate.authorize(kind) {
            let _ = reply.send(Err(e));
            return;
        }

        debug!(
            instance = %self.entry.name,
            op = %kind,
            op_id = %op.id,
            from = %from,
            "executing operation"
        );

        let result = self.execute(kind, from).await;

        // The caller may have been unblocked by its deadline already;
        // the result was still applied above, which is what matters.
        let _ = reply.send(result);
    }

    async fn execute(&mut self, kind: OpKind, from: InstanceStatus) -> PenliteResult<InstanceStatus> {
        let reason = ChangeReason::Operation(kind);
        match kind {
            OpKind::Start => {
                self.commit(InstanceStatus::Starting, reason);
                if let Err(e) = self.ensure_handle().await {
                    self.fail_commit(&e, reason);
                    return Err(e);
                }
                // A Defined instance has never been materialized natively.
                if from == InstanceStatus::Defined {
                    self.native(NativeOp::Create, reason).await?;
                }
                self.native(NativeOp::Start, reason).await?;
                self.commit(InstanceStatus::Running, reason);
                Ok(InstanceStatus::Running)
            }
            OpKind::Stop => {
                self.commit(InstanceStatus::Stopping, reason);
                if let Err(e) = self.ensure_handle().await {
                    self.fail_commit(&e, reason);
                    return Err(e);
                }
                self.native(NativeOp::Stop, reason).await?;
                self.commit(InstanceStatus::Stopped, reason);
                Ok(InstanceStatus::Stopped)
            }
            OpKind::Freeze => {
                if let Err(e) = self.ensure_handle().await {
                    self.fail_commit(&e, reason);
                    return Err(e);
                }
                self.native(NativeOp::Freeze, reason).await?;
                self.commit(InstanceStatus::Frozen, reason);
                Ok(InstanceStatus::Frozen)
            }
            OpKind::Unfreeze => {
                if let Err(e) = self.ensure_handle().await {
                    self.fail_commit(&e, reason);
                    return Err(e);
                }
                self.native(NativeOp::Unfreeze, reason).await?;
                self.commit(InstanceStatus::Running, reason);
                Ok(InstanceStatus::Running)
            }
            OpKind::Destroy => {
                self.commit(InstanceStatus::Destroying, reason);
                // A Defined instance never acquired native resources;
                // there is nothing to remove on that side.
                if from != InstanceStatus::Defined {
                    if let Err(e) = self.ensure_handle().await {
                        self.fail_commit(&e, reason);
                        return Err(e);
                    }
                    // The native side may already be gone (out-of-band
                    // removal, or a start that failed before create);
                    // destroying a missing instance natively would fail.
                    match self.observe_native().await {
                        Ok(ObservedState::Missing) => {}
                        Ok(_) => self.native(NativeOp::Destroy, reason).await?,
                        Err(e) => {
                            self.fail_commit(&e, reason);
                            return Err(e);
                        }
                    }
                }
                if let Some(guard) = self.handle.take() {
                    let _ = tokio::task::spawn_blocking(move || guard.close()).await;
                }
                self.commit(InstanceStatus::Destroyed, reason);
                if let Err(e) = self.ctx.store.remove(&self.entry.name) {
                    warn!(instance = %self.entry.name, error = %e, "removing store row");
                }
                Ok(InstanceStatus::Destroyed)
            }
        }
    }

    /// Open the native session if this worker has none.
    async fn ensure_handle(&mut self) -> PenliteResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let runtime = Arc::clone(&self.ctx.runtime);
        let name = self.entry.name.clone();
        let config = self.entry.config.clone();
        let opened = tokio::task::spawn_blocking(move || {
            HandleGuard::open(runtime.as_ref(), name.as_str(), &config)
        })
        .await
        .map_err(|e| {
            PenliteError::IndeterminateState(format!("native open aborted: {}", e))
        })??;
        self.handle = Some(opened);
        Ok(())
    }

    /// Run one native call off-thread, tracked to completion.
    ///
    /// On failure the handle is in an indeterminate native state: it is
    /// torn down (never reused) and the instance moves to `Error`.
    async fn native(&mut self, op: NativeOp, reason: ChangeReason) -> PenliteResult<()> {
        let mut guard = self.handle.take().ok_or_else(|| {
            PenliteError::Internal(format!("no native handle for {}", self.entry.name))
        })?;

        let joined = tokio::task::spawn_blocking(move || {
            let result = guard.invoke(op);
            (guard, result)
        })
        .await;

        match joined {
            Ok((guard, Ok(_status))) => {
                self.handle = Some(guard);
                Ok(())
            }
            Ok((guard, Err(e))) => {
                // Failed handles are never reused.
                let _ = tokio::task::spawn_blocking(move || guard.close()).await;
                self.fail_commit(&e, reason);
                Err(e)
            }
            Err(join_err) => {
                // The closure panicked; the guard closed during unwind.
                let e = PenliteError::IndeterminateState(format!(
                    "native {} call aborted: {}",
                    op, join_err
                ));
                self.fail_commit(&e, reason);
                Err(e)
            }
        }
    }

    /// Query native state off-thread, tracked like any other call.
    ///
    /// On failure the session is poisoned: it is torn down (the next use
    /// reopens a fresh one) and the error returned to the caller, which
    /// decides whether it is state-affecting.
    async fn observe_native(&mut self) -> PenliteResult<ObservedState> {
        if self.handle.is_none() {
            self.ensure_handle().await?;
        }
        let mut guard = self.handle.take().ok_or_else(|| {
            PenliteError::Internal(format!("no native handle for {}", self.entry.name))
        })?;

        let joined = tokio::task::spawn_blocking(move || {
            let observed = guard.observe();
            (guard, observed)
        })
        .await;

        match joined {
            Ok((guard, Ok(observed))) => {
                self.handle = Some(guard);
                Ok(observed)
            }
            Ok((guard, Err(e))) => {
                let _ = tokio::task::spawn_blocking(move || guard.close()).await;
                Err(e)
            }
            Err(join_err) => Err(PenliteError::IndeterminateState(format!(
                "native observe aborted: {}",
                join_err
            ))),
        }
    }

    /// Reconcile recorded state against observed native state.
    ///
    /// Only reached through the queue while no operation is in flight, so
    /// it can never race a transition.
    async fn reconcile(&mut self) {
        let recorded = self.entry.status();
        if !recorded.is_supervised() {
            return;
        }

        let observed = match self.observe_native().await {
            Ok(observed) => observed,
            Err(e) => {
                // Leave recorded state alone on a failed query; the next
                // probe reopens a fresh session.
                warn!(instance = %self.entry.name, error = %e, "reconcile: observe failed");
                return;
            }
        };

        match (recorded, observed) {
            // The payload exited (or the instance vanished) out of band.
            (
                InstanceStatus::Running | InstanceStatus::Frozen | InstanceStatus::Stopping,
                ObservedState::Stopped | ObservedState::Missing,
            ) => {
                debug!(
                    instance = %self.entry.name,
                    recorded = %recorded,
                    observed = ?observed,
                    "reconciled unexpected exit"
                );
                self.commit(InstanceStatus::Stopped, ChangeReason::Reconciled);
            }
            // Out-of-band freezer flips.
            (InstanceStatus::Running, ObservedState::Frozen) => {
                self.commit(InstanceStatus::Frozen, ChangeReason::Reconciled);
            }
            (InstanceStatus::Frozen, ObservedState::Running) => {
                self.commit(InstanceStatus::Running, ChangeReason::Reconciled);
            }
            _ => {}
        }
    }

    /// Commit a validated transition: state, store, event.
    fn commit(&self, to: InstanceStatus, reason: ChangeReason) {
        let from = {
            let mut state = self.entry.state.write();
            let from = state.status;
            if let Err(e) = state.transition_to(to) {
                // Unreachable given the validation above; surfaced loudly
                // rather than silently corrupting state.
                warn!(instance = %self.entry.name, error = %e, "refused commit");
                return;
            }
            from
        };
        if let Err(e) = self.ctx.store.update_status(&self.entry.name, to) {
            warn!(instance = %self.entry.name, error = %e, "persisting status");
        }
        self.ctx.events.emit(&self.entry.name, from, to, reason);
    }

    /// Commit a failure: instance moves to `Error` carrying the detail.
    fn fail_commit(&self, error: &PenliteError, reason: ChangeReason) {
        let from = {
            let mut state = self.entry.state.write();
            let from = state.status;
            state.fail(error.to_string());
            from
        };
        if let Err(e) = self
            .ctx
            .store
            .update_status(&self.entry.name, InstanceStatus::Error)
        {
            warn!(instance = %self.entry.name, error = %e, "persisting error status");
        }
        self.ctx
            .events
            .emit(&self.entry.name, from, InstanceStatus::Error, reason);
    }

    /// Observe native state once during startup adoption (no worker yet).
    pub(crate) fn probe_for_adoption(
        runtime: &dyn NativeRuntime,
        name: &str,
        config: &crate::options::InstanceConfig,
    ) -> PenliteResult<(HandleGuard, ObservedState)> {
        let mut guard = HandleGuard::open(runtime, name, config)?;
        let observed = guard.observe()?;
        Ok((guard, observed))
    }
}
