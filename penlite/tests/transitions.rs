//! Property tests for the lifecycle state machine.

use penlite::{InstanceState, InstanceStatus};
use proptest::prelude::*;

static ALL_STATUSES: [InstanceStatus; 9] = [
    InstanceStatus::Defined,
    InstanceStatus::Starting,
    InstanceStatus::Running,
    InstanceStatus::Stopping,
    InstanceStatus::Stopped,
    InstanceStatus::Frozen,
    InstanceStatus::Error,
    InstanceStatus::Destroying,
    InstanceStatus::Destroyed,
];

fn any_status() -> impl Strategy<Value = InstanceStatus> {
    prop::sample::select(&ALL_STATUSES[..])
}

proptest! {
    /// For any sequence of requested transitions from Defined, the final
    /// recorded state is the target of the last transition the machine
    /// accepted; rejected requests never change recorded state.
    #[test]
    fn recorded_state_tracks_last_accepted_transition(
        requests in prop::collection::vec(any_status(), 0..64)
    ) {
        let mut state = InstanceState::new();
        let mut expected = InstanceStatus::Defined;

        for target in requests {
            let before = state.status;
            match state.transition_to(target) {
                Ok(()) => {
                    prop_assert!(before.can_transition_to(target));
                    expected = target;
                }
                Err(_) => {
                    prop_assert!(!before.can_transition_to(target));
                    prop_assert_eq!(state.status, before);
                }
            }
        }
        prop_assert_eq!(state.status, expected);
    }

    /// Destroyed is terminal: no transition out of it is ever accepted.
    #[test]
    fn destroyed_is_terminal(target in any_status()) {
        prop_assert!(!InstanceStatus::Destroyed.can_transition_to(target));
    }

    /// Error is only left through Destroying.
    #[test]
    fn error_only_recovers_via_destroy(target in any_status()) {
        if InstanceStatus::Error.can_transition_to(target) {
            prop_assert_eq!(target, InstanceStatus::Destroying);
        }
    }

    /// Every state except Destroying/Destroyed accepts a destroy request.
    #[test]
    fn destroy_reachable_from_every_live_state(status in any_status()) {
        match status {
            InstanceStatus::Destroying | InstanceStatus::Destroyed => {
                prop_assert!(!status.can_destroy());
            }
            _ => {
                prop_assert!(status.can_destroy());
                prop_assert!(status.can_transition_to(InstanceStatus::Destroying));
            }
        }
    }
}
