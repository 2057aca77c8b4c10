//! Phase handling: the transition table and the per-phase sub-task handlers
//!
//! [`next_step`] decides what a reconcile pass does from the experiment's
//! observable state only. The handlers in [`handler`] carry the step out on
//! the in-memory status; persisting it is the reconciler's job.

use crate::crds::experiment::{ExperimentDetailUnit, PhaseType, StatusType};

pub mod handler;

pub use handler::{initialize, solve_created, solve_running, solve_terminal};

/// Work selected for one reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Deleted after a terminal inject: ask for recovery before letting go
    RequestRecover,
    /// Nothing left to undo; drop the finalizer
    ReleaseFinalizer,
    /// Resolve the selector and seed the inject sub-tasks
    Initialize,
    SolveCreated(PhaseType),
    SolveRunning(PhaseType),
    /// Terminal inject with recovery requested: seed the recover sub-tasks
    SolveTerminal(PhaseType),
    Idle,
}

/// Transition table for one reconcile pass.
///
/// Rules apply in order: terminal deletion, terminal recover, empty phase,
/// then the handler for the current phase and status.
#[must_use]
pub fn next_step(
    deleting: bool,
    phase: Option<PhaseType>,
    status: StatusType,
    target_phase: PhaseType,
) -> Step {
    let terminal = status.is_terminal();
    match phase {
        Some(PhaseType::Inject) if deleting && terminal && target_phase == PhaseType::Inject => {
            Step::RequestRecover
        }
        Some(PhaseType::Recover) if terminal => Step::ReleaseFinalizer,
        None => Step::Initialize,
        Some(phase) => match status {
            StatusType::Created => Step::SolveCreated(phase),
            StatusType::Running => Step::SolveRunning(phase),
            _ if phase == PhaseType::Inject && target_phase == PhaseType::Recover => {
                Step::SolveTerminal(phase)
            }
            _ => Step::Idle,
        },
    }
}

/// Overall status after a create pass, with the message shown to users
#[must_use]
pub fn aggregate_created(units: &[ExperimentDetailUnit]) -> (StatusType, &'static str) {
    let created = units
        .iter()
        .filter(|u| u.status == StatusType::Created)
        .count();
    let failed = units
        .iter()
        .filter(|u| u.status == StatusType::Failed)
        .count();

    if created > 0 {
        (
            StatusType::Created,
            "created count is more than 0, need to retry",
        )
    } else if failed == units.len() {
        (StatusType::Failed, "create failed")
    } else {
        (
            StatusType::Running,
            "create finish, start to solve running status",
        )
    }
}

/// Overall status after a polling pass
#[must_use]
pub fn aggregate_running(units: &[ExperimentDetailUnit]) -> (StatusType, &'static str) {
    let running = units
        .iter()
        .filter(|u| u.status == StatusType::Running)
        .count();
    let failed = units
        .iter()
        .filter(|u| u.status == StatusType::Failed)
        .count();

    if running > 0 {
        (
            StatusType::Running,
            "run count is more than 0, need to retry",
        )
    } else if failed == 0 {
        (StatusType::Success, "run success")
    } else if failed == units.len() {
        (StatusType::Failed, "run all failed")
    } else {
        (StatusType::PartSuccess, "run part success")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(statuses: &[StatusType]) -> Vec<ExperimentDetailUnit> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| ExperimentDetailUnit {
                inject_object_name: format!("deployment/default/app-{i}"),
                uid: format!("uid-{i}"),
                status: *status,
                ..ExperimentDetailUnit::default()
            })
            .collect()
    }

    #[test]
    fn test_empty_phase_initializes() {
        assert_eq!(
            next_step(false, None, StatusType::Created, PhaseType::Inject),
            Step::Initialize
        );
    }

    #[test]
    fn test_active_phases_dispatch_by_status() {
        for phase in [PhaseType::Inject, PhaseType::Recover] {
            assert_eq!(
                next_step(false, Some(phase), StatusType::Created, PhaseType::Inject),
                Step::SolveCreated(phase)
            );
            assert_eq!(
                next_step(true, Some(phase), StatusType::Running, PhaseType::Recover),
                Step::SolveRunning(phase)
            );
        }
    }

    #[test]
    fn test_terminal_inject_waits_for_recover_request() {
        for status in [
            StatusType::Success,
            StatusType::Failed,
            StatusType::PartSuccess,
        ] {
            assert_eq!(
                next_step(false, Some(PhaseType::Inject), status, PhaseType::Inject),
                Step::Idle
            );
            assert_eq!(
                next_step(false, Some(PhaseType::Inject), status, PhaseType::Recover),
                Step::SolveTerminal(PhaseType::Inject)
            );
        }
    }

    #[test]
    fn test_deleting_terminal_inject_requests_recover_first() {
        assert_eq!(
            next_step(
                true,
                Some(PhaseType::Inject),
                StatusType::Success,
                PhaseType::Inject
            ),
            Step::RequestRecover
        );
        assert_eq!(
            next_step(
                true,
                Some(PhaseType::Inject),
                StatusType::Success,
                PhaseType::Recover
            ),
            Step::SolveTerminal(PhaseType::Inject)
        );
    }

    #[test]
    fn test_terminal_recover_releases_finalizer() {
        for deleting in [true, false] {
            assert_eq!(
                next_step(
                    deleting,
                    Some(PhaseType::Recover),
                    StatusType::PartSuccess,
                    PhaseType::Recover
                ),
                Step::ReleaseFinalizer
            );
        }
    }

    #[test]
    fn test_aggregate_created() {
        use StatusType::{Created, Failed, Running};
        assert_eq!(aggregate_created(&units(&[Created, Running])).0, Created);
        assert_eq!(aggregate_created(&units(&[Failed, Failed])).0, Failed);
        assert_eq!(aggregate_created(&units(&[Failed, Running])).0, Running);
    }

    #[test]
    fn test_aggregate_running() {
        use StatusType::{Failed, PartSuccess, Running, Success};
        assert_eq!(aggregate_running(&units(&[Running, Success])).0, Running);
        assert_eq!(aggregate_running(&units(&[Success, Success])).0, Success);
        assert_eq!(aggregate_running(&units(&[Failed, Failed])).0, Failed);
        assert_eq!(
            aggregate_running(&units(&[Failed, Success])),
            (PartSuccess, "run part success")
        );
    }
}
