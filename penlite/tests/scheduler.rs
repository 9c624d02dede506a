//! Integration tests for operation scheduling: per-instance
//! serialization, cross-instance parallelism, deadlines, cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use penlite::{
    Controller, ControllerOptions, InstanceConfig, InstanceStatus, NativeOp, OpKind, Operation,
    PenliteError,
};
use penlite_test_utils::{MockRuntime, temp_state_dir};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TestContext {
    controller: Controller,
    runtime: MockRuntime,
    _state_dir: TempDir,
}

impl TestContext {
    async fn new() -> Self {
        let state_dir = temp_state_dir();
        let runtime = MockRuntime::new();
        let controller = Controller::open(
            ControllerOptions {
                state_dir: state_dir.path().to_path_buf(),
                // Keep the reconciler quiet during timing-sensitive tests.
                reconcile_interval: Duration::from_secs(3600),
                default_deadline: Duration::from_secs(5),
                ..Default::default()
            },
            Arc::new(runtime.clone()),
        )
        .await
        .expect("opening controller");
        Self {
            controller,
            runtime,
            _state_dir: state_dir,
        }
    }
}

fn config() -> InstanceConfig {
    InstanceConfig::with_template("busybox")
}

// ============================================================================
// SERIALIZATION
// ============================================================================

#[tokio::test]
async fn operations_on_one_instance_never_overlap() {
    let ctx = TestContext::new().await;
    ctx.controller.define("web", config()).unwrap();
    ctx.runtime.set_call_delay(Duration::from_millis(20));

    // Hammer one instance from many concurrent submitters. Conflicting
    // requests fail with InvalidTransition; the property under test is
    // that the native layer never sees two calls at once.
    let submissions = (0..10).map(|round| {
        let controller = ctx.controller.clone();
        tokio::spawn(async move {
            let result = if round % 2 == 0 {
                controller.start("web").await
            } else {
                controller.stop("web").await
            };
            // Outcomes vary with interleaving; errors must be classified.
            if let Err(e) = result {
                assert!(matches!(
                    e,
                    PenliteError::InvalidTransition(_) | PenliteError::Timeout(_)
                ));
            }
        })
    });
    for joined in futures::future::join_all(submissions).await {
        joined.unwrap();
    }

    assert_eq!(ctx.runtime.max_inflight("web"), 1);
}

#[tokio::test]
async fn same_instance_operations_run_in_submission_order() {
    let ctx = TestContext::new().await;
    ctx.controller.define("web", config()).unwrap();
    ctx.runtime.set_call_delay(Duration::from_millis(10));

    // start → stop → start submitted back-to-back without awaiting.
    let c1 = ctx.controller.clone();
    let c2 = ctx.controller.clone();
    let c3 = ctx.controller.clone();
    let first = tokio::spawn(async move { c1.start("web").await });
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = tokio::spawn(async move { c2.stop("web").await });
    tokio::time::sleep(Duration::from_millis(2)).await;
    let third = tokio::spawn(async move { c3.start("web").await });

    assert_eq!(first.await.unwrap().unwrap(), InstanceStatus::Running);
    assert_eq!(second.await.unwrap().unwrap(), InstanceStatus::Stopped);
    assert_eq!(third.await.unwrap().unwrap(), InstanceStatus::Running);

    assert_eq!(ctx.runtime.calls("web", NativeOp::Start), 2);
    assert_eq!(ctx.runtime.calls("web", NativeOp::Stop), 1);
}

// ============================================================================
// CROSS-INSTANCE PARALLELISM
// ============================================================================

#[tokio::test]
async fn different_instances_start_in_parallel() {
    let ctx = TestContext::new().await;
    ctx.controller.define("a", config()).unwrap();
    ctx.controller.define("b", config()).unwrap();

    // Bring both to Stopped so the timed start is exactly one native call.
    ctx.controller.start("a").await.unwrap();
    ctx.controller.start("b").await.unwrap();
    ctx.controller.stop("a").await.unwrap();
    ctx.controller.stop("b").await.unwrap();

    ctx.runtime.set_call_delay(Duration::from_millis(100));

    let began = Instant::now();
    let (a, b) = tokio::join!(ctx.controller.start("a"), ctx.controller.start("b"));
    let elapsed = began.elapsed();

    assert_eq!(a.unwrap(), InstanceStatus::Running);
    assert_eq!(b.unwrap(), InstanceStatus::Running);

    // Two 100ms native calls overlapping, not back-to-back: parallel
    // completion lands well under the 200ms serial floor.
    assert!(
        elapsed < Duration::from_millis(190),
        "starts were serialized: {:?}",
        elapsed
    );
    assert!(elapsed >= Duration::from_millis(100));
}

// ============================================================================
// DEADLINES
// ============================================================================

#[tokio::test]
async fn queued_operation_expiring_never_reaches_native_layer() {
    let ctx = TestContext::new().await;
    ctx.controller.define("web", config()).unwrap();
    ctx.controller.start("web").await.unwrap();

    // Occupy the worker with a slow stop, then queue a freeze that
    // expires while waiting behind it.
    ctx.runtime.set_call_delay(Duration::from_millis(300));
    let slow = {
        let controller = ctx.controller.clone();
        tokio::spawn(async move { controller.stop("web").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let expired = ctx
        .controller
        .submit(
            "web",
            Operation::new(OpKind::Freeze, Duration::from_millis(50)),
        )
        .await;

    assert!(matches!(expired.unwrap_err(), PenliteError::Timeout(_)));
    assert_eq!(slow.await.unwrap().unwrap(), InstanceStatus::Stopped);
    // The expired freeze was failed before any native call.
    assert_eq!(ctx.runtime.calls("web", NativeOp::Freeze), 0);
}

#[tokio::test]
async fn mid_call_timeout_unblocks_caller_but_keeps_the_result() {
    let ctx = TestContext::new().await;
    ctx.controller.define("web", config()).unwrap();
    ctx.controller.start("web").await.unwrap();
    ctx.controller.stop("web").await.unwrap();

    ctx.runtime.set_call_delay(Duration::from_millis(250));

    let began = Instant::now();
    let result = ctx
        .controller
        .submit(
            "web",
            Operation::new(OpKind::Start, Duration::from_millis(50)),
        )
        .await;
    let unblocked_after = began.elapsed();

    // Caller unblocked at its deadline, well before the call finished.
    assert!(matches!(result.unwrap_err(), PenliteError::Timeout(_)));
    assert!(unblocked_after < Duration::from_millis(200));

    // The native call was not aborted: its result still drives the state
    // machine once it completes.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        ctx.controller.status("web").unwrap(),
        InstanceStatus::Running
    );
    assert_eq!(ctx.runtime.calls("web", NativeOp::Start), 2);

    // The handle was not concurrently reused: follow-up work queues
    // behind the tracked call and succeeds.
    ctx.runtime.set_call_delay(Duration::ZERO);
    assert_eq!(
        ctx.controller.stop("web").await.unwrap(),
        InstanceStatus::Stopped
    );
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn cancelled_before_start_is_a_full_no_op() {
    let ctx = TestContext::new().await;
    ctx.controller.define("web", config()).unwrap();
    ctx.controller.start("web").await.unwrap();

    // Worker busy with a slow stop; the queued freeze is cancelled
    // before it starts.
    ctx.runtime.set_call_delay(Duration::from_millis(200));
    let slow = {
        let controller = ctx.controller.clone();
        tokio::spawn(async move { controller.stop("web").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancel = CancellationToken::new();
    let op = Operation::new(OpKind::Freeze, Duration::from_secs(5)).with_cancel(cancel.clone());
    let pending = {
        let controller = ctx.controller.clone();
        tokio::spawn(async move { controller.submit("web", op).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    assert!(matches!(
        pending.await.unwrap().unwrap_err(),
        PenliteError::Cancelled(_)
    ));
    slow.await.unwrap().unwrap();
    assert_eq!(ctx.runtime.calls("web", NativeOp::Freeze), 0);
}

#[tokio::test]
async fn destroy_supersedes_queued_operations() {
    let ctx = TestContext::new().await;
    ctx.controller.define("web", config()).unwrap();
    ctx.controller.start("web").await.unwrap();

    // In-flight stop runs to completion; the freeze queued behind it is
    // superseded by the destroy submitted after it.
    ctx.runtime.set_call_delay(Duration::from_millis(150));
    let slow_stop = {
        let controller = ctx.controller.clone();
        tokio::spawn(async move { controller.stop("web").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let queued_freeze = {
        let controller = ctx.controller.clone();
        tokio::spawn(async move { controller.freeze("web").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let destroy = {
        let controller = ctx.controller.clone();
        tokio::spawn(async move { controller.destroy("web").await })
    };

    // The in-flight stop still completed and applied.
    assert_eq!(slow_stop.await.unwrap().unwrap(), InstanceStatus::Stopped);
    // The queued freeze never ran.
    assert!(matches!(
        queued_freeze.await.unwrap().unwrap_err(),
        PenliteError::Cancelled(_)
    ));
    assert_eq!(ctx.runtime.calls("web", NativeOp::Freeze), 0);
    // The destroy went through.
    assert_eq!(destroy.await.unwrap().unwrap(), InstanceStatus::Destroyed);
}
