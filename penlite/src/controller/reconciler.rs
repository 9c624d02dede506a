//! Reconciler loop: keeps recorded state honest.
//!
//! Periodically enqueues a probe for every supervised, idle instance
//! through that instance's own operation queue. The probe itself runs in
//! the instance worker, which is what makes reconciliation and
//! operations mutually exclusive per instance.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::registry::InstanceRegistry;
use crate::sched::WorkItem;

pub(crate) async fn run(
    registry: InstanceRegistry,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for entry in registry.supervised_idle() {
            // Reserve the queue slot before sending so a burst of ticks
            // cannot stack probes behind each other.
            entry.pending.fetch_add(1, Ordering::SeqCst);
            match entry.ops.try_send(WorkItem::Reconcile) {
                Ok(()) => {
                    trace!(instance = %entry.name, "enqueued reconcile probe");
                }
                Err(_) => {
                    // Queue filled up in the meantime; the instance is no
                    // longer idle and does not need a probe this round.
                    entry.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
    trace!("reconciler exited");
}
