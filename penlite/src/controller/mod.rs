//! The lifecycle controller: public entry point.
//!
//! A [`Controller`] owns a registry of instances, a persistent store, one
//! worker task per instance, and a reconciler. Callers submit lifecycle
//! operations by instance name and get back a result (or a classified
//! error) plus optional state-change notifications via [`subscribe`].
//!
//! [`subscribe`]: Controller::subscribe

mod reconciler;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{PenliteError, PenliteResult};
use crate::events::{EventHub, StateChange};
use crate::gate::CapabilityGate;
use crate::instance::{InstanceName, InstanceState, InstanceStatus};
use crate::lock::StateDirLock;
use crate::native::{HandleGuard, NativeRuntime, ObservedState};
use crate::options::{ControllerOptions, InstanceConfig};
use crate::registry::{InstanceEntry, InstanceInfo, InstanceRegistry};
use crate::sched::{OpKind, Operation, WorkItem};
use crate::store::{InstanceRecord, InstanceStore};
use crate::util::init_logging_for;

use worker::{InstanceWorker, WorkerContext};

/// Event buffer retained per subscriber.
const EVENT_CAPACITY: usize = 64;

/// The instance lifecycle controller.
///
/// Cheaply cloneable; all clones share the same state. Exactly one
/// controller may use a given state directory at a time (flock-guarded).
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use penlite::{Controller, ControllerOptions, InstanceConfig, LxcCommandRuntime};
///
/// # async fn example() -> penlite::PenliteResult<()> {
/// let controller = Controller::open(
///     ControllerOptions::default(),
///     Arc::new(LxcCommandRuntime::new()),
/// )
/// .await?;
///
/// controller.define("web", InstanceConfig::with_template("busybox"))?;
/// controller.start("web").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

struct ControllerInner {
    options: ControllerOptions,
    runtime: Arc<dyn NativeRuntime>,
    registry: InstanceRegistry,
    store: Arc<InstanceStore>,
    events: EventHub,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
    _lock: StateDirLock,
}

impl Controller {
    /// Open a controller over `options.state_dir`, reconciling persisted
    /// instances against live native state before returning.
    ///
    /// Instances found running (or frozen) natively are adopted as such
    /// rather than assumed stopped; instances whose native state cannot
    /// be probed and whose recorded state implied a live payload come up
    /// in `Error`.
    ///
    /// # Errors
    ///
    /// Fails if another controller holds the state directory, or on
    /// store initialization problems.
    pub async fn open(
        options: ControllerOptions,
        runtime: Arc<dyn NativeRuntime>,
    ) -> PenliteResult<Self> {
        if !options.state_dir.is_absolute() {
            return Err(PenliteError::Config(format!(
                "state_dir must be an absolute path, got {}",
                options.state_dir.display()
            )));
        }
        if options.queue_depth == 0 {
            return Err(PenliteError::Config("queue_depth must be non-zero".into()));
        }

        init_logging_for(&options.state_dir)?;
        let lock = StateDirLock::acquire(&options.state_dir)?;
        let store = Arc::new(InstanceStore::open(
            &options.state_dir.join("penlite.db"),
        )?);

        let registry = InstanceRegistry::new();
        let events = EventHub::new(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            runtime: Arc::clone(&runtime),
            gate: CapabilityGate::new(options.gate),
            store: Arc::clone(&store),
            events: events.clone(),
            shutdown: shutdown.clone(),
        });

        let controller = Self {
            inner: Arc::new(ControllerInner {
                options,
                runtime,
                registry,
                store,
                events,
                ctx,
                shutdown,
                tasks: Mutex::new(Vec::new()),
                is_shutdown: AtomicBool::new(false),
                _lock: lock,
            }),
        };

        // Replay the store and adopt whatever the native layer reports
        // before accepting any operation.
        let records = controller.inner.store.load_all()?;
        info!(count = records.len(), "adopting persisted instances");
        for record in records {
            controller.adopt(record).await;
        }

        let reconciler = tokio::spawn(reconciler::run(
            controller.inner.registry.clone(),
            controller.inner.options.reconcile_interval,
            controller.inner.shutdown.clone(),
        ));
        controller.inner.tasks.lock().push(reconciler);

        Ok(controller)
    }

    // ========================================================================
    // Instance registration
    // ========================================================================

    /// Define a new instance: validate, persist, register, spawn worker.
    ///
    /// The instance starts in `Defined`; nothing native is allocated
    /// until the first `start`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if a live instance holds the name (a destroyed
    /// name may be re-defined).
    pub fn define(&self, name: &str, config: InstanceConfig) -> PenliteResult<()> {
        self.ensure_open()?;
        let name = InstanceName::parse(name)?;

        if let Some(existing) = self.inner.registry.get(name.as_str())
            && existing.status() != InstanceStatus::Destroyed
        {
            return Err(PenliteError::AlreadyExists(name.to_string()));
        }

        self.inner
            .store
            .insert(&name, &config, InstanceStatus::Defined)?;
        if let Err(e) =
            self.spawn_instance(name.clone(), config, InstanceState::new(), Utc::now(), None)
        {
            // Roll the row back so the name is not wedged.
            let _ = self.inner.store.remove(&name);
            return Err(e);
        }
        info!(instance = %name, "instance defined");
        Ok(())
    }

    fn spawn_instance(
        &self,
        name: InstanceName,
        config: InstanceConfig,
        state: InstanceState,
        created_at: DateTime<Utc>,
        handle: Option<HandleGuard>,
    ) -> PenliteResult<()> {
        let (tx, rx) = mpsc::channel(self.inner.options.queue_depth);
        let entry = Arc::new(InstanceEntry::new(name, config, state, created_at, tx));
        self.inner.registry.register(Arc::clone(&entry))?;

        let worker = InstanceWorker::new(entry, Arc::clone(&self.inner.ctx), rx, handle);
        let task = tokio::spawn(worker.run());
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    /// Adopt one persisted record during startup.
    async fn adopt(&self, record: InstanceRecord) {
        let runtime = Arc::clone(&self.inner.runtime);
        let name = record.name.clone();
        let config = record.config.clone();
        let probed = tokio::task::spawn_blocking(move || {
            InstanceWorker::probe_for_adoption(runtime.as_ref(), name.as_str(), &config)
        })
        .await;

        let recorded = record.status;
        let (mut state, handle) = match probed {
            Ok(Ok((guard, observed))) => {
                let status = match observed {
                    ObservedState::Running => InstanceStatus::Running,
                    ObservedState::Frozen => InstanceStatus::Frozen,
                    // Never materialized natively stays Defined; anything
                    // else that is not running is Stopped.
                    ObservedState::Stopped if recorded == InstanceStatus::Defined => {
                        InstanceStatus::Defined
                    }
                    ObservedState::Stopped => InstanceStatus::Stopped,
                    ObservedState::Missing => InstanceStatus::Defined,
                };
                (InstanceState::restored(status), Some(guard))
            }
            Ok(Err(e)) => {
                // Unprobeable: a recorded live or in-flight payload is in
                // an unknown condition now.
                let status = if recorded.is_transient() || recorded.is_supervised() {
                    InstanceStatus::Error
                } else {
                    recorded
                };
                let mut state = InstanceState::restored(status);
                if status == InstanceStatus::Error {
                    state.last_error = Some(format!("unprobeable at startup: {}", e));
                }
                (state, None)
            }
            Err(join_err) => {
                warn!(instance = %record.name, error = %join_err, "adoption probe aborted");
                let mut state = InstanceState::restored(InstanceStatus::Error);
                state.last_error = Some(format!("adoption probe aborted: {}", join_err));
                (state, None)
            }
        };

        let adopted = state.status;
        if adopted == recorded {
            // Unchanged instances keep their stored timeline.
            state.last_updated = record.updated_at;
        } else {
            info!(
                instance = %record.name,
                recorded = %recorded,
                adopted = %adopted,
                "adopted instance"
            );
            if let Err(e) = self.inner.store.update_status(&record.name, adopted) {
                warn!(instance = %record.name, error = %e, "persisting adopted status");
            }
        }

        if let Err(e) = self.spawn_instance(
            record.name.clone(),
            record.config,
            state,
            record.created_at,
            handle,
        ) {
            warn!(instance = %record.name, error = %e, "registering adopted instance");
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Submit an operation against a named instance.
    ///
    /// Operations on the same instance run strictly in submission order,
    /// one at a time; different instances proceed in parallel. Returns
    /// the resulting status, or:
    ///
    /// - `Timeout` if the deadline elapsed — queued operations are failed
    ///   without reaching the native layer; an operation already inside a
    ///   native call keeps running and its result still drives the state
    ///   machine, only the caller is unblocked;
    /// - `Cancelled` if the operation's token fired first;
    /// - any of the classified lifecycle errors from §`errors`.
    pub async fn submit(&self, name: &str, op: Operation) -> PenliteResult<InstanceStatus> {
        self.ensure_open()?;
        let entry = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| PenliteError::NotFound(name.to_string()))?;

        let kind = op.kind;
        if entry.status() == InstanceStatus::Destroyed {
            return destroyed_outcome(name, kind);
        }

        let deadline = op.deadline;
        let cancel = op.cancel.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        entry.pending.fetch_add(1, Ordering::SeqCst);
        if kind == OpKind::Destroy {
            entry.destroys_waiting.fetch_add(1, Ordering::SeqCst);
        }

        let undo_counters = || {
            entry.pending.fetch_sub(1, Ordering::SeqCst);
            if kind == OpKind::Destroy {
                entry.destroys_waiting.fetch_sub(1, Ordering::SeqCst);
            }
        };

        // The queue send itself is bounded by the deadline too: a full
        // queue must not hold the caller past it.
        tokio::select! {
            sent = entry.ops.send(WorkItem::Op { op, reply: reply_tx }) => {
                if sent.is_err() {
                    undo_counters();
                    // Worker gone: the instance was destroyed or the
                    // controller is shutting down.
                    return if entry.status() == InstanceStatus::Destroyed {
                        destroyed_outcome(name, kind)
                    } else {
                        Err(PenliteError::Cancelled(format!(
                            "{} on {}: controller shutting down",
                            kind, name
                        )))
                    };
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                undo_counters();
                return Err(PenliteError::Timeout(format!(
                    "{} on {}: queue full past deadline",
                    kind, name
                )));
            }
        }

        tokio::select! {
            result = reply_rx => match result {
                Ok(result) => result,
                Err(_) => Err(PenliteError::Cancelled(format!(
                    "{} on {}: abandoned during shutdown",
                    kind, name
                ))),
            },
            _ = tokio::time::sleep_until(deadline) => Err(PenliteError::Timeout(format!(
                "{} on {}: deadline elapsed",
                kind, name
            ))),
            _ = cancel.cancelled() => Err(PenliteError::Cancelled(format!(
                "{} on {} cancelled by caller",
                kind, name
            ))),
        }
    }

    /// Start (creating natively on first start) with the default deadline.
    pub async fn start(&self, name: &str) -> PenliteResult<InstanceStatus> {
        self.submit(name, self.op(OpKind::Start)).await
    }

    /// Stop gracefully with the default deadline.
    pub async fn stop(&self, name: &str) -> PenliteResult<InstanceStatus> {
        self.submit(name, self.op(OpKind::Stop)).await
    }

    /// Suspend via the native freezer.
    pub async fn freeze(&self, name: &str) -> PenliteResult<InstanceStatus> {
        self.submit(name, self.op(OpKind::Freeze)).await
    }

    /// Resume a frozen instance.
    pub async fn unfreeze(&self, name: &str) -> PenliteResult<InstanceStatus> {
        self.submit(name, self.op(OpKind::Unfreeze)).await
    }

    /// Destroy the instance. Idempotent: destroying an already-destroyed
    /// instance is a no-op success.
    pub async fn destroy(&self, name: &str) -> PenliteResult<InstanceStatus> {
        self.submit(name, self.op(OpKind::Destroy)).await
    }

    fn op(&self, kind: OpKind) -> Operation {
        Operation::new(kind, self.inner.options.default_deadline)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Current lifecycle status of an instance.
    pub fn status(&self, name: &str) -> PenliteResult<InstanceStatus> {
        self.inner
            .registry
            .get(name)
            .map(|e| e.status())
            .ok_or_else(|| PenliteError::NotFound(name.to_string()))
    }

    /// Full snapshot of an instance.
    pub fn info(&self, name: &str) -> PenliteResult<InstanceInfo> {
        self.inner
            .registry
            .get(name)
            .map(|e| e.to_info())
            .ok_or_else(|| PenliteError::NotFound(name.to_string()))
    }

    /// Snapshot of all live instances, oldest first.
    pub fn list(&self) -> Vec<InstanceInfo> {
        self.inner.registry.list()
    }

    /// Subscribe to committed state changes.
    ///
    /// Best-effort fan-out: a subscriber that lags beyond the buffer
    /// misses events (signalled by `RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Shut the controller down: finish the in-flight operation per
    /// instance, fail queued ones, release native sessions, stop the
    /// reconciler. Instances themselves keep running natively.
    ///
    /// Returns `false` if shutdown already ran.
    pub async fn shutdown(&self) -> PenliteResult<bool> {
        if self
            .inner
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        info!("controller shutting down");
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "joining controller task");
            }
        }
        Ok(true)
    }

    fn ensure_open(&self) -> PenliteResult<()> {
        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            return Err(PenliteError::Cancelled("controller is shut down".into()));
        }
        Ok(())
    }
}

/// Outcome of an operation against a destroyed (tombstoned) instance.
fn destroyed_outcome(name: &str, kind: OpKind) -> PenliteResult<InstanceStatus> {
    if kind == OpKind::Destroy {
        Ok(InstanceStatus::Destroyed)
    } else {
        Err(PenliteError::InvalidTransition(format!(
            "cannot {} {} while destroyed",
            kind, name
        )))
    }
}
