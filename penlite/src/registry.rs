//! In-memory instance registry.
//!
//! The registry is the controller's authoritative map of registered
//! instances. It is injected state with a defined lifecycle: populated at
//! startup from the persistent store, mutated only by the controller, and
//! enumerated by the reconciler. Destroyed instances leave a tombstone
//! entry so a repeated destroy stays an idempotent no-op; tombstoned
//! names may be re-defined.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::errors::{PenliteError, PenliteResult};
use crate::instance::{InstanceName, InstanceState, InstanceStatus};
use crate::options::InstanceConfig;
use crate::sched::WorkItem;

/// Snapshot of one instance for callers.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    /// Instance name.
    pub name: InstanceName,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Declared configuration.
    pub config: InstanceConfig,
    /// When the instance was defined.
    pub created_at: DateTime<Utc>,
    /// Last committed transition time.
    pub last_updated: DateTime<Utc>,
    /// Failure detail if the instance is in `Error`.
    pub last_error: Option<String>,
}

/// Shared per-instance entry: state snapshot plus the worker's queue.
pub(crate) struct InstanceEntry {
    pub(crate) name: InstanceName,
    pub(crate) config: InstanceConfig,
    pub(crate) created_at: DateTime<Utc>,
    /// Authoritative lifecycle state. Written only by the instance
    /// worker; read concurrently for snapshots.
    pub(crate) state: RwLock<InstanceState>,
    /// The worker's serialized operation queue.
    pub(crate) ops: mpsc::Sender<WorkItem>,
    /// Queued plus in-flight work items. The reconciler only probes
    /// instances where this is zero.
    pub(crate) pending: AtomicUsize,
    /// Queued destroy operations. While non-zero, queued non-destroy
    /// operations are cancelled before they start.
    pub(crate) destroys_waiting: AtomicUsize,
}

impl InstanceEntry {
    pub(crate) fn new(
        name: InstanceName,
        config: InstanceConfig,
        state: InstanceState,
        created_at: DateTime<Utc>,
        ops: mpsc::Sender<WorkItem>,
    ) -> Self {
        Self {
            name,
            config,
            created_at,
            state: RwLock::new(state),
            ops,
            pending: AtomicUsize::new(0),
            destroys_waiting: AtomicUsize::new(0),
        }
    }

    pub(crate) fn status(&self) -> InstanceStatus {
        self.state.read().status
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn to_info(&self) -> InstanceInfo {
        let state = self.state.read();
        InstanceInfo {
            name: self.name.clone(),
            status: state.status,
            config: self.config.clone(),
            created_at: self.created_at,
            last_updated: state.last_updated,
            last_error: state.last_error.clone(),
        }
    }
}

/// Thread-safe registry of live instances.
#[derive(Clone)]
pub(crate) struct InstanceRegistry {
    inner: Arc<RwLock<HashMap<InstanceName, Arc<InstanceEntry>>>>,
}

impl InstanceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new instance.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken by a live (non
    /// tombstoned) instance.
    pub(crate) fn register(&self, entry: Arc<InstanceEntry>) -> PenliteResult<()> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.get(&entry.name)
            && existing.status() != InstanceStatus::Destroyed
        {
            return Err(PenliteError::AlreadyExists(entry.name.to_string()));
        }
        tracing::debug!(instance = %entry.name, status = %entry.status(), "registering instance");
        inner.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<InstanceEntry>> {
        self.inner.read().get(name).cloned()
    }

    /// List live instances, oldest first. Tombstones are skipped.
    pub(crate) fn list(&self) -> Vec<InstanceInfo> {
        let inner = self.inner.read();
        let mut infos: Vec<InstanceInfo> = inner
            .values()
            .filter(|e| e.status() != InstanceStatus::Destroyed)
            .map(|e| e.to_info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Entries the reconciler should probe: supervised status, idle queue.
    pub(crate) fn supervised_idle(&self) -> Vec<Arc<InstanceEntry>> {
        self.inner
            .read()
            .values()
            .filter(|e| e.status().is_supervised() && e.is_idle())
            .cloned()
            .collect()
    }

    /// All entries, tombstones included (shutdown drain).
    pub(crate) fn all(&self) -> Vec<Arc<InstanceEntry>> {
        self.inner.read().values().cloned().collect()
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, status: InstanceStatus) -> Arc<InstanceEntry> {
        let (tx, _rx) = mpsc::channel(1);
        let mut state = InstanceState::new();
        state.force_status(status);
        Arc::new(InstanceEntry::new(
            InstanceName::parse(name).unwrap(),
            InstanceConfig::default(),
            state,
            Utc::now(),
            tx,
        ))
    }

    #[test]
    fn register_and_get() {
        let registry = InstanceRegistry::new();
        registry.register(entry("a", InstanceStatus::Defined)).unwrap();

        let got = registry.get("a").unwrap();
        assert_eq!(got.status(), InstanceStatus::Defined);
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = InstanceRegistry::new();
        registry.register(entry("a", InstanceStatus::Defined)).unwrap();

        let err = registry
            .register(entry("a", InstanceStatus::Defined))
            .unwrap_err();
        assert!(matches!(err, PenliteError::AlreadyExists(_)));
    }

    #[test]
    fn tombstone_can_be_replaced() {
        let registry = InstanceRegistry::new();
        registry.register(entry("a", InstanceStatus::Destroyed)).unwrap();
        registry.register(entry("a", InstanceStatus::Defined)).unwrap();
        assert_eq!(registry.get("a").unwrap().status(), InstanceStatus::Defined);
    }

    #[test]
    fn list_skips_tombstones_and_sorts_oldest_first() {
        let registry = InstanceRegistry::new();
        registry.register(entry("a", InstanceStatus::Running)).unwrap();
        registry.register(entry("b", InstanceStatus::Destroyed)).unwrap();
        registry.register(entry("c", InstanceStatus::Stopped)).unwrap();

        let infos = registry.list();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].created_at <= infos[1].created_at);
        assert!(infos.iter().all(|i| i.status != InstanceStatus::Destroyed));
    }

    #[test]
    fn supervised_idle_filters_by_status_and_queue() {
        let registry = InstanceRegistry::new();
        registry.register(entry("run", InstanceStatus::Running)).unwrap();
        registry.register(entry("stop", InstanceStatus::Stopped)).unwrap();

        let busy = entry("busy", InstanceStatus::Running);
        busy.pending.fetch_add(1, Ordering::SeqCst);
        registry.register(busy).unwrap();

        let probed = registry.supervised_idle();
        assert_eq!(probed.len(), 1);
        assert_eq!(probed[0].name.as_str(), "run");
    }
}
