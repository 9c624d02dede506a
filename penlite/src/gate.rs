//! Capability gate: privilege checks before privileged native calls.
//!
//! Runs once per operation, before the native layer is touched. Denial is
//! terminal for that operation — surfaced as `PermissionDenied`, never
//! retried, never silently downgraded.

use crate::errors::{PenliteError, PenliteResult};
use crate::sched::OpKind;

/// Gate policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GatePolicy {
    /// No checks. For rootless development and tests against a mock
    /// native layer.
    #[default]
    Permissive,

    /// Require the effective capability each operation needs. On
    /// non-Linux hosts enforcing always denies: there is no native
    /// container layer to be privileged against.
    Enforcing,
}

/// Capability gate applied by the instance worker.
#[derive(Clone, Copy, Debug)]
pub struct CapabilityGate {
    policy: GatePolicy,
}

impl CapabilityGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    /// Gate that grants everything.
    pub fn permissive() -> Self {
        Self::new(GatePolicy::Permissive)
    }

    /// Authorize `kind` or fail with `PermissionDenied`.
    pub fn authorize(&self, kind: OpKind) -> PenliteResult<()> {
        match self.policy {
            GatePolicy::Permissive => Ok(()),
            GatePolicy::Enforcing => self.authorize_enforcing(kind),
        }
    }

    #[cfg(target_os = "linux")]
    fn authorize_enforcing(&self, kind: OpKind) -> PenliteResult<()> {
        let Some(required) = required_capability(kind) else {
            return Ok(());
        };
        match caps::has_cap(None, caps::CapSet::Effective, required) {
            Ok(true) => Ok(()),
            Ok(false) => Err(PenliteError::PermissionDenied(format!(
                "{} requires effective {:?}",
                kind, required
            ))),
            Err(e) => Err(PenliteError::PermissionDenied(format!(
                "cannot read process capabilities: {}",
                e
            ))),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn authorize_enforcing(&self, kind: OpKind) -> PenliteResult<()> {
        Err(PenliteError::PermissionDenied(format!(
            "{} denied: capability enforcement is only supported on Linux",
            kind
        )))
    }
}

impl Default for CapabilityGate {
    fn default() -> Self {
        Self::permissive()
    }
}

/// The capability an operation kind needs under the enforcing policy.
///
/// Every lifecycle mutation drives namespaces and cgroups on the native
/// side, so they all require CAP_SYS_ADMIN. `None` means unprivileged.
#[cfg(target_os = "linux")]
fn required_capability(kind: OpKind) -> Option<caps::Capability> {
    match kind {
        OpKind::Start
        | OpKind::Stop
        | OpKind::Freeze
        | OpKind::Unfreeze
        | OpKind::Destroy => Some(caps::Capability::CAP_SYS_ADMIN),
    }
}
