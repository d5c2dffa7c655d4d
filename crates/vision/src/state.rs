//! Evaluation state machine observed by the viewer.
//!
//! Every transition names the task that requests it. Only the task that moved
//! the machine out of `Idle` may move it further, so a superseded task that
//! finishes late cannot overwrite the state of its successor.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::scheduler::TaskId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationState {
    #[default]
    Idle,
    ProcessingPrompt,
    GeneratingResponse,
}

impl EvaluationState {
    pub fn label(self) -> &'static str {
        match self {
            EvaluationState::Idle => "idle",
            EvaluationState::ProcessingPrompt => "processing prompt",
            EvaluationState::GeneratingResponse => "generating response",
        }
    }
}

impl fmt::Display for EvaluationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Task lifecycle events that drive the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    /// The task acquired the engine and starts processing its prompt.
    Admitted,
    /// The first token was produced.
    FirstToken,
    /// The task completed, failed or was cancelled.
    Finished,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task {task} does not own the evaluation state (owner: {owner:?})")]
    NotOwner { task: TaskId, owner: Option<TaskId> },
    #[error("invalid transition from {from} on {event:?}")]
    Invalid {
        from: EvaluationState,
        event: TaskEvent,
    },
}

#[derive(Debug, Default)]
pub struct StateMachine {
    state: EvaluationState,
    owner: Option<TaskId>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EvaluationState {
        self.state
    }

    /// Task currently holding the machine outside `Idle`.
    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// Apply `event` on behalf of `task`, returning the new state.
    ///
    /// Rejected transitions leave the machine untouched.
    pub fn apply(
        &mut self,
        task: TaskId,
        event: TaskEvent,
    ) -> Result<EvaluationState, TransitionError> {
        use EvaluationState::*;

        if event != TaskEvent::Admitted && self.owner != Some(task) {
            return Err(TransitionError::NotOwner {
                task,
                owner: self.owner,
            });
        }

        let (next, owner) = match (self.state, event) {
            (Idle, TaskEvent::Admitted) => (ProcessingPrompt, Some(task)),
            (ProcessingPrompt, TaskEvent::FirstToken) => (GeneratingResponse, Some(task)),
            // Leaving ProcessingPrompt directly covers failure or cancellation before any token.
            (ProcessingPrompt | GeneratingResponse, TaskEvent::Finished) => (Idle, None),
            (from, event) => return Err(TransitionError::Invalid { from, event }),
        };

        self.state = next;
        self.owner = owner;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId::from(n)
    }

    #[test]
    fn full_cycle_returns_to_idle() {
        let mut machine = StateMachine::new();
        assert_eq!(
            machine.apply(id(1), TaskEvent::Admitted),
            Ok(EvaluationState::ProcessingPrompt)
        );
        assert_eq!(
            machine.apply(id(1), TaskEvent::FirstToken),
            Ok(EvaluationState::GeneratingResponse)
        );
        assert_eq!(
            machine.apply(id(1), TaskEvent::Finished),
            Ok(EvaluationState::Idle)
        );
        assert_eq!(machine.owner(), None);
    }

    #[test]
    fn finishing_before_first_token_is_allowed() {
        let mut machine = StateMachine::new();
        machine.apply(id(1), TaskEvent::Admitted).unwrap();
        assert_eq!(
            machine.apply(id(1), TaskEvent::Finished),
            Ok(EvaluationState::Idle)
        );
    }

    #[test]
    fn stale_task_cannot_finish_successor() {
        let mut machine = StateMachine::new();
        machine.apply(id(1), TaskEvent::Admitted).unwrap();
        machine.apply(id(1), TaskEvent::Finished).unwrap();
        machine.apply(id(2), TaskEvent::Admitted).unwrap();
        machine.apply(id(2), TaskEvent::FirstToken).unwrap();

        let err = machine.apply(id(1), TaskEvent::Finished).unwrap_err();
        assert_eq!(
            err,
            TransitionError::NotOwner {
                task: id(1),
                owner: Some(id(2))
            }
        );
        assert_eq!(machine.state(), EvaluationState::GeneratingResponse);
    }

    #[test]
    fn second_admission_is_rejected() {
        let mut machine = StateMachine::new();
        machine.apply(id(1), TaskEvent::Admitted).unwrap();
        assert!(matches!(
            machine.apply(id(2), TaskEvent::Admitted),
            Err(TransitionError::Invalid { .. })
        ));
        assert_eq!(machine.owner(), Some(id(1)));
    }

    #[test]
    fn first_token_twice_is_invalid() {
        let mut machine = StateMachine::new();
        machine.apply(id(1), TaskEvent::Admitted).unwrap();
        machine.apply(id(1), TaskEvent::FirstToken).unwrap();
        assert!(machine.apply(id(1), TaskEvent::FirstToken).is_err());
    }

    #[test]
    fn finishing_from_idle_is_rejected() {
        let mut machine = StateMachine::new();
        assert!(machine.apply(id(3), TaskEvent::Finished).is_err());
        assert_eq!(machine.state(), EvaluationState::Idle);
    }
}
