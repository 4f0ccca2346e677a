//! Pure status state machine: `(status, event) -> (newStatus?, stopWatcher?)`.
//! No I/O, no side effects — the orchestrator interprets the `stopWatcher`
//! hint and performs the actual watcher teardown.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Idle,
    Initializing,
    Reviewing,
    Running,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub enum StatusEvent {
    Start { has_initialized: bool },
    InitComplete { has_features: bool, review_mode: bool },
    InitFailed,
    ReviewConfirmed,
    SessionComplete { all_done: bool },
    Stop { all_agents_stopped: bool },
    Error,
}

/// Outcome of applying an event to a status: the new status (if the event
/// caused a transition) and whether the watcher should be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub new_status: Option<ProjectStatus>,
    pub stop_watcher: bool,
}

const NO_TRANSITION: Transition = Transition { new_status: None, stop_watcher: false };

/// Apply `event` to `status`. Returns `NO_TRANSITION` for any combination not
/// explicitly listed — this function never panics and always terminates.
pub fn apply(status: ProjectStatus, event: StatusEvent) -> Transition {
    use ProjectStatus::*;
    use StatusEvent::*;

    match event {
        Start { has_initialized } => match status {
            Idle | Paused | Completed | Error => Transition {
                new_status: Some(if has_initialized { Running } else { Initializing }),
                stop_watcher: false,
            },
            _ => NO_TRANSITION,
        },
        InitComplete { has_features, review_mode } => {
            if status == Initializing && has_features {
                Transition {
                    new_status: Some(if review_mode { Reviewing } else { Running }),
                    stop_watcher: false,
                }
            } else {
                NO_TRANSITION
            }
        }
        InitFailed => {
            if status == Initializing {
                Transition { new_status: Some(Error), stop_watcher: true }
            } else {
                NO_TRANSITION
            }
        }
        ReviewConfirmed => {
            if status == Reviewing {
                Transition { new_status: Some(Running), stop_watcher: false }
            } else {
                NO_TRANSITION
            }
        }
        SessionComplete { all_done } => {
            if status == Running && all_done {
                Transition { new_status: Some(Completed), stop_watcher: true }
            } else {
                NO_TRANSITION
            }
        }
        Stop { all_agents_stopped } => {
            if all_agents_stopped {
                Transition { new_status: Some(Paused), stop_watcher: true }
            } else {
                NO_TRANSITION
            }
        }
        Error => Transition { new_status: Some(ProjectStatus::Error), stop_watcher: true },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProjectStatus::*;

    #[test]
    fn start_from_idle_without_init_goes_initializing() {
        let t = apply(Idle, StatusEvent::Start { has_initialized: false });
        assert_eq!(t.new_status, Some(Initializing));
        assert!(!t.stop_watcher);
    }

    #[test]
    fn start_from_paused_with_init_goes_running() {
        let t = apply(Paused, StatusEvent::Start { has_initialized: true });
        assert_eq!(t.new_status, Some(Running));
    }

    #[test]
    fn start_from_running_is_noop() {
        let t = apply(Running, StatusEvent::Start { has_initialized: true });
        assert_eq!(t.new_status, None);
        assert!(!t.stop_watcher);
    }

    #[test]
    fn init_complete_without_features_is_noop() {
        let t = apply(Initializing, StatusEvent::InitComplete { has_features: false, review_mode: true });
        assert_eq!(t.new_status, None);
    }

    #[test]
    fn init_complete_with_review_mode_goes_reviewing() {
        let t = apply(Initializing, StatusEvent::InitComplete { has_features: true, review_mode: true });
        assert_eq!(t.new_status, Some(Reviewing));
    }

    #[test]
    fn init_complete_without_review_mode_goes_running() {
        let t = apply(Initializing, StatusEvent::InitComplete { has_features: true, review_mode: false });
        assert_eq!(t.new_status, Some(Running));
    }

    #[test]
    fn init_failed_stops_watcher() {
        let t = apply(Initializing, StatusEvent::InitFailed);
        assert_eq!(t.new_status, Some(Error));
        assert!(t.stop_watcher);
    }

    #[test]
    fn init_failed_outside_initializing_is_noop() {
        let t = apply(Running, StatusEvent::InitFailed);
        assert_eq!(t.new_status, None);
    }

    #[test]
    fn review_confirmed_goes_running() {
        let t = apply(Reviewing, StatusEvent::ReviewConfirmed);
        assert_eq!(t.new_status, Some(Running));
    }

    #[test]
    fn session_complete_all_done_transitions_and_stops_watcher() {
        let t = apply(Running, StatusEvent::SessionComplete { all_done: true });
        assert_eq!(t.new_status, Some(Completed));
        assert!(t.stop_watcher);
    }

    #[test]
    fn session_complete_not_all_done_is_noop() {
        let t = apply(Running, StatusEvent::SessionComplete { all_done: false });
        assert_eq!(t.new_status, None);
    }

    #[test]
    fn stop_with_all_agents_stopped_goes_paused_from_any_status() {
        for status in [Idle, Initializing, Reviewing, Running, Paused, Completed, Error] {
            let t = apply(status, StatusEvent::Stop { all_agents_stopped: true });
            assert_eq!(t.new_status, Some(Paused), "status={status:?}");
            assert!(t.stop_watcher);
        }
    }

    #[test]
    fn stop_without_all_agents_stopped_is_noop() {
        let t = apply(Running, StatusEvent::Stop { all_agents_stopped: false });
        assert_eq!(t.new_status, None);
    }

    #[test]
    fn error_event_always_transitions() {
        for status in [Idle, Initializing, Reviewing, Running, Paused, Completed, Error] {
            let t = apply(status, StatusEvent::Error);
            assert_eq!(t.new_status, Some(Error));
            assert!(t.stop_watcher);
        }
    }

    #[test]
    fn idempotent_replay_yields_identical_tuples() {
        let a = apply(Running, StatusEvent::SessionComplete { all_done: true });
        let b = apply(Running, StatusEvent::SessionComplete { all_done: true });
        assert_eq!(a, b);
    }
}
