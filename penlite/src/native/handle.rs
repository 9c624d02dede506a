//! Owned wrapper around a native session.

use tracing::warn;

use crate::errors::{PenliteError, PenliteResult};
use crate::native::{NativeHandle, NativeOp, NativeRuntime, NativeStatus, ObservedState};
use crate::options::InstanceConfig;

/// Owned, non-copyable guard over one native session.
///
/// Guarantees the pairing the native layer itself does not: `close` runs
/// exactly once on every exit path — explicitly via [`HandleGuard::close`]
/// or from `Drop`. After any failed call the guard is poisoned and every
/// further use fails with `IndeterminateState`; the worker tears the
/// handle down and opens a fresh one if the instance continues existing.
pub struct HandleGuard {
    inner: Option<Box<dyn NativeHandle>>,
    instance: String,
    poisoned: bool,
}

impl HandleGuard {
    /// Open a native session for `instance`.
    ///
    /// # Errors
    ///
    /// Propagates the native open failure. The native implementation is
    /// responsible for rolling back partial acquisition; nothing is
    /// retained on this side.
    pub fn open(
        runtime: &dyn NativeRuntime,
        instance: &str,
        config: &InstanceConfig,
    ) -> PenliteResult<Self> {
        let inner = runtime.open(instance, config)?;
        tracing::debug!(instance = %instance, "opened native handle");
        Ok(Self {
            inner: Some(inner),
            instance: instance.to_string(),
            poisoned: false,
        })
    }

    /// Perform a lifecycle operation through the handle.
    ///
    /// A non-success status poisons the handle and is returned as
    /// `NativeCallFailed` carrying the native code and detail.
    pub fn invoke(&mut self, op: NativeOp) -> PenliteResult<NativeStatus> {
        let inner = self.usable(op.as_str())?;
        let status = inner.invoke(op);
        if status.success() {
            Ok(status)
        } else {
            self.poisoned = true;
            Err(PenliteError::NativeCallFailed {
                op: op.as_str().to_string(),
                code: status.code,
                detail: status.detail,
            })
        }
    }

    /// Query the actual native state of the instance.
    ///
    /// A query failure poisons the handle: the session can no longer be
    /// trusted to report anything coherent.
    pub fn observe(&mut self) -> PenliteResult<ObservedState> {
        let inner = self.usable("observe")?;
        match inner.observe() {
            Ok(state) => Ok(state),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// True once a call has failed through this guard.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Release the session explicitly.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn usable(&mut self, what: &str) -> PenliteResult<&mut Box<dyn NativeHandle>> {
        if self.poisoned {
            return Err(PenliteError::IndeterminateState(format!(
                "refusing {} on {}: handle poisoned by an earlier failed call",
                what, self.instance
            )));
        }
        self.inner.as_mut().ok_or_else(|| {
            PenliteError::Internal(format!("native handle for {} already closed", self.instance))
        })
    }

    fn close_inner(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
            tracing::debug!(instance = %self.instance, "closed native handle");
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.inner.is_some() {
            if self.poisoned {
                warn!(
                    instance = %self.instance,
                    "dropping poisoned native handle without explicit close"
                );
            }
            self.close_inner();
        }
    }
}
