//! penlite — embeddable lifecycle controller for LXC-style container
//! instances.
//!
//! The controller drives instances through define → start → run → stop →
//! destroy against an opaque native runtime boundary, supervises them for
//! out-of-band exits, and survives restarts by reconciling its persisted
//! records against live native state.
//!
//! ## Architecture
//!
//! - [`native`]: the blocking native boundary — [`NativeRuntime`] /
//!   [`NativeHandle`] traits, the owned [`HandleGuard`] session wrapper,
//!   and the shipped [`LxcCommandRuntime`] subprocess backend.
//! - [`instance`]: identity and the lifecycle state machine.
//! - [`Controller`]: per-instance serialized operation queues, the
//!   capability gate, the reconciler, persistence, and events.
//!
//! ## Concurrency model
//!
//! Operations on one instance execute strictly in submission order, one
//! at a time; different instances proceed fully in parallel. Native
//! calls are blocking and run under `spawn_blocking`; instance state is
//! mutated only by that instance's worker task.

pub mod controller;
pub mod errors;
pub mod events;
pub mod gate;
pub mod instance;
pub mod native;
pub mod options;
pub mod registry;
pub mod sched;

mod lock;
mod store;
mod util;

pub use controller::Controller;
pub use errors::{PenliteError, PenliteResult};
pub use events::{ChangeReason, StateChange};
pub use gate::{CapabilityGate, GatePolicy};
pub use instance::{InstanceName, InstanceState, InstanceStatus};
pub use native::{
    HandleGuard, LxcCommandRuntime, NativeHandle, NativeOp, NativeRuntime, NativeStatus,
    ObservedState,
};
pub use options::{ControllerOptions, InstanceConfig};
pub use registry::InstanceInfo;
pub use sched::{OpId, OpKind, Operation};
pub use util::init_logging_for;
