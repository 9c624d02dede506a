//! Test utilities for penlite: a scriptable mock native runtime.
//!
//! The mock models the native layer as a tiny state machine per instance
//! (missing → stopped → running → frozen → ...) and records everything
//! the controller does to it: opens, closes, per-op invocation counts,
//! and the in-flight concurrency high-water mark. Tests script failures
//! and latency, then assert on the recorded calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use penlite::{
    InstanceConfig, NativeHandle, NativeOp, NativeRuntime, NativeStatus, ObservedState,
    PenliteError, PenliteResult,
};

#[derive(Default)]
struct MockCore {
    /// Native-side truth per instance. Absent means Missing.
    states: HashMap<String, ObservedState>,
    fail_open: HashMap<String, String>,
    fail_ops: HashMap<(String, NativeOp), (i32, String)>,
    delay: Duration,
    opens: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    calls: HashMap<(String, NativeOp), usize>,
    observes: HashMap<String, usize>,
    inflight: HashMap<String, usize>,
    max_inflight: HashMap<String, usize>,
    global_inflight: usize,
    global_max_inflight: usize,
}

impl MockCore {
    fn begin_call(&mut self, name: &str, op: NativeOp) {
        *self.calls.entry((name.to_string(), op)).or_default() += 1;

        let current = self.inflight.entry(name.to_string()).or_default();
        *current += 1;
        let current = *current;
        let max = self.max_inflight.entry(name.to_string()).or_default();
        *max = (*max).max(current);

        self.global_inflight += 1;
        self.global_max_inflight = self.global_max_inflight.max(self.global_inflight);
    }

    fn end_call(&mut self, name: &str) {
        if let Some(current) = self.inflight.get_mut(name) {
            *current = current.saturating_sub(1);
        }
        self.global_inflight = self.global_inflight.saturating_sub(1);
    }

    fn apply(&mut self, name: &str, op: NativeOp) {
        let next = match op {
            NativeOp::Create => ObservedState::Stopped,
            NativeOp::Start => ObservedState::Running,
            NativeOp::Stop => ObservedState::Stopped,
            NativeOp::Freeze => ObservedState::Frozen,
            NativeOp::Unfreeze => ObservedState::Running,
            NativeOp::Destroy => ObservedState::Missing,
        };
        if next == ObservedState::Missing {
            self.states.remove(name);
        } else {
            self.states.insert(name.to_string(), next);
        }
    }
}

/// Scriptable in-memory native runtime.
#[derive(Clone, Default)]
pub struct MockRuntime {
    core: Arc<Mutex<MockCore>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Every lifecycle invocation sleeps this long (on the blocking
    /// thread, as a real native call would).
    pub fn set_call_delay(&self, delay: Duration) {
        self.core.lock().delay = delay;
    }

    /// Make `open` fail for this instance.
    pub fn fail_open(&self, name: &str, detail: &str) {
        self.core
            .lock()
            .fail_open
            .insert(name.to_string(), detail.to_string());
    }

    /// Make one operation fail for this instance (persistent until
    /// cleared).
    pub fn fail_op(&self, name: &str, op: NativeOp, code: i32, detail: &str) {
        self.core
            .lock()
            .fail_ops
            .insert((name.to_string(), op), (code, detail.to_string()));
    }

    /// Clear scripted failures for this instance.
    pub fn clear_failures(&self, name: &str) {
        let mut core = self.core.lock();
        core.fail_open.remove(name);
        core.fail_ops.retain(|(n, _), _| n != name);
    }

    /// Overwrite the native-side state (simulates out-of-band changes,
    /// e.g. the payload exiting on its own).
    pub fn set_native_state(&self, name: &str, state: ObservedState) {
        let mut core = self.core.lock();
        if state == ObservedState::Missing {
            core.states.remove(name);
        } else {
            core.states.insert(name.to_string(), state);
        }
    }

    // ------------------------------------------------------------------
    // Assertions
    // ------------------------------------------------------------------

    pub fn native_state(&self, name: &str) -> ObservedState {
        *self
            .core
            .lock()
            .states
            .get(name)
            .unwrap_or(&ObservedState::Missing)
    }

    /// Successful opens for this instance.
    pub fn opens(&self, name: &str) -> usize {
        *self.core.lock().opens.get(name).unwrap_or(&0)
    }

    /// Closes (including rollback of a failed open) for this instance.
    pub fn closes(&self, name: &str) -> usize {
        *self.core.lock().closes.get(name).unwrap_or(&0)
    }

    /// Lifecycle invocations of `op` for this instance.
    pub fn calls(&self, name: &str, op: NativeOp) -> usize {
        *self
            .core
            .lock()
            .calls
            .get(&(name.to_string(), op))
            .unwrap_or(&0)
    }

    /// State queries for this instance.
    pub fn observes(&self, name: &str) -> usize {
        *self.core.lock().observes.get(name).unwrap_or(&0)
    }

    /// Highest number of concurrently in-flight lifecycle calls seen for
    /// this instance. The controller's serialization guarantee means this
    /// should never exceed 1.
    pub fn max_inflight(&self, name: &str) -> usize {
        *self.core.lock().max_inflight.get(name).unwrap_or(&0)
    }

    /// Highest number of concurrently in-flight lifecycle calls across
    /// all instances.
    pub fn global_max_inflight(&self) -> usize {
        self.core.lock().global_max_inflight
    }
}

impl NativeRuntime for MockRuntime {
    fn open(&self, name: &str, _config: &InstanceConfig) -> PenliteResult<Box<dyn NativeHandle>> {
        let mut core = self.core.lock();
        if let Some(detail) = core.fail_open.get(name).cloned() {
            // Partial acquisition is rolled back before the error
            // surfaces; the rollback counts as the session's one cleanup.
            *core.closes.entry(name.to_string()).or_default() += 1;
            return Err(PenliteError::NativeCallFailed {
                op: "open".to_string(),
                code: 1,
                detail: Some(detail),
            });
        }
        *core.opens.entry(name.to_string()).or_default() += 1;
        drop(core);

        Ok(Box::new(MockHandle {
            name: name.to_string(),
            core: Arc::clone(&self.core),
        }))
    }
}

struct MockHandle {
    name: String,
    core: Arc<Mutex<MockCore>>,
}

impl NativeHandle for MockHandle {
    fn invoke(&mut self, op: NativeOp) -> NativeStatus {
        let delay = {
            let mut core = self.core.lock();
            core.begin_call(&self.name, op);
            core.delay
        };

        // Block like a real native call would; the controller must keep
        // this off its coordination path.
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut core = self.core.lock();
        core.end_call(&self.name);
        if let Some((code, detail)) = core.fail_ops.get(&(self.name.clone(), op)).cloned() {
            return NativeStatus::failed(code, detail);
        }
        core.apply(&self.name, op);
        NativeStatus::ok()
    }

    fn observe(&mut self) -> PenliteResult<ObservedState> {
        let mut core = self.core.lock();
        *core.observes.entry(self.name.clone()).or_default() += 1;
        Ok(*core
            .states
            .get(&self.name)
            .unwrap_or(&ObservedState::Missing))
    }

    fn close(&mut self) {
        let mut core = self.core.lock();
        *core.closes.entry(self.name.clone()).or_default() += 1;
    }
}

/// A temp dir for controller state, kept alive for the test's duration.
pub fn temp_state_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("creating temp state dir")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_applies_native_state_machine() {
        let runtime = MockRuntime::new();
        let mut handle = runtime
            .open("m1", &InstanceConfig::default())
            .expect("open");

        assert_eq!(runtime.native_state("m1"), ObservedState::Missing);
        assert!(handle.invoke(NativeOp::Create).success());
        assert_eq!(runtime.native_state("m1"), ObservedState::Stopped);
        assert!(handle.invoke(NativeOp::Start).success());
        assert_eq!(runtime.native_state("m1"), ObservedState::Running);
        assert!(handle.invoke(NativeOp::Freeze).success());
        assert_eq!(runtime.native_state("m1"), ObservedState::Frozen);
        assert!(handle.invoke(NativeOp::Destroy).success());
        assert_eq!(runtime.native_state("m1"), ObservedState::Missing);

        assert_eq!(runtime.calls("m1", NativeOp::Start), 1);
        assert_eq!(runtime.opens("m1"), 1);
    }

    #[test]
    fn scripted_open_failure_counts_cleanup() {
        let runtime = MockRuntime::new();
        runtime.fail_open("m1", "no such template");

        assert!(runtime.open("m1", &InstanceConfig::default()).is_err());
        assert_eq!(runtime.opens("m1"), 0);
        assert_eq!(runtime.closes("m1"), 1);
    }

    #[test]
    fn scripted_op_failure_leaves_state() {
        let runtime = MockRuntime::new();
        runtime.fail_op("m1", NativeOp::Start, 2, "cgroup setup failed");

        let mut handle = runtime
            .open("m1", &InstanceConfig::default())
            .expect("open");
        assert!(handle.invoke(NativeOp::Create).success());
        let status = handle.invoke(NativeOp::Start);
        assert_eq!(status.code, 2);
        assert_eq!(runtime.native_state("m1"), ObservedState::Stopped);
    }
}
