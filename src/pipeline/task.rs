//! Per-stage, per-request unit of work and its state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::payload::StageInput;
use super::request::StageReport;
use super::stage::Stage;
use crate::error::StageError;
use crate::scheduler::TaskHandle;

/// Lifecycle state of a stage task.
///
/// States only move forward: `Pending < Dispatched < Running < terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageState {
    fn rank(&self) -> u8 {
        match self {
            StageState::Pending => 0,
            StageState::Dispatched => 1,
            StageState::Running => 2,
            StageState::Completed | StageState::Failed | StageState::Skipped => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Pending => write!(f, "pending"),
            StageState::Dispatched => write!(f, "dispatched"),
            StageState::Running => write!(f, "running"),
            StageState::Completed => write!(f, "completed"),
            StageState::Failed => write!(f, "failed"),
            StageState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Rejected state change. The task is left untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal transition for stage '{stage}': {from} -> {to}")]
pub struct TransitionError {
    pub stage: Stage,
    pub from: StageState,
    pub to: StageState,
}

/// Tracked state of one stage within one request.
#[derive(Debug, Clone)]
pub struct StageTask {
    pub request_id: String,
    pub stage: Stage,
    pub input: Option<StageInput>,
    pub attempts: u32,
    pub last_error: Option<StageError>,
    pub result: Option<Value>,
    pub handle: Option<TaskHandle>,
    state: StageState,
    history: Vec<StageState>,
}

impl StageTask {
    pub fn new(request_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            request_id: request_id.into(),
            stage,
            input: None,
            attempts: 0,
            last_error: None,
            result: None,
            handle: None,
            state: StageState::Pending,
            history: vec![StageState::Pending],
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Every state the task has been in, oldest first.
    pub fn history(&self) -> &[StageState] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves to `next`. Re-entering the current non-terminal state is a no-op.
    pub fn transition(&mut self, next: StageState) -> Result<(), TransitionError> {
        if self.state.is_terminal() || next.rank() < self.state.rank() {
            return Err(TransitionError {
                stage: self.stage,
                from: self.state,
                to: next,
            });
        }
        if next != self.state {
            self.state = next;
            self.history.push(next);
        }
        Ok(())
    }

    pub fn complete(&mut self, result: Value) -> Result<(), TransitionError> {
        self.transition(StageState::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: StageError) -> Result<(), TransitionError> {
        self.transition(StageState::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Marks the task Skipped because `dependency` did not complete.
    pub fn skip(&mut self, dependency: Stage) -> Result<(), TransitionError> {
        self.transition(StageState::Skipped)?;
        self.last_error = Some(StageError::DependencyFailed(dependency));
        Ok(())
    }

    pub fn report(&self) -> StageReport {
        StageReport {
            state: self.state,
            attempts: self.attempts,
            error: self.last_error.as_ref().map(ToString::to_string),
            result: self.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_forward_transitions() {
        let mut task = StageTask::new("r", Stage::Chunker);
        task.transition(StageState::Dispatched).unwrap();
        task.transition(StageState::Running).unwrap();
        task.transition(StageState::Running).unwrap();
        task.complete(json!({"chunks": []})).unwrap();

        assert_eq!(
            task.history(),
            &[
                StageState::Pending,
                StageState::Dispatched,
                StageState::Running,
                StageState::Completed
            ]
        );
        assert!(task.is_terminal());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut task = StageTask::new("r", Stage::Prompt);
        task.transition(StageState::Running).unwrap();

        let err = task.transition(StageState::Dispatched).unwrap_err();
        assert_eq!(err.from, StageState::Running);
        assert_eq!(err.to, StageState::Dispatched);
        assert_eq!(task.state(), StageState::Running);
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut task = StageTask::new("r", Stage::Llm);
        task.skip(Stage::Prompt).unwrap();

        for next in [
            StageState::Pending,
            StageState::Running,
            StageState::Completed,
            StageState::Failed,
            StageState::Skipped,
        ] {
            assert!(task.transition(next).is_err());
        }
        assert!(task.complete(json!({})).is_err());
        assert!(task.result.is_none());
        assert_eq!(task.history(), &[StageState::Pending, StageState::Skipped]);
        assert_eq!(
            task.last_error,
            Some(StageError::DependencyFailed(Stage::Prompt))
        );
    }

    #[test]
    fn test_history_never_decreases() {
        let mut task = StageTask::new("r", Stage::GraphDb);
        let attempts = [
            StageState::Dispatched,
            StageState::Pending,
            StageState::Running,
            StageState::Dispatched,
            StageState::Failed,
            StageState::Running,
        ];
        for next in attempts {
            let _ = task.transition(next);
        }
        let ranks: Vec<u8> = task.history().iter().map(StageState::rank).collect();
        assert!(ranks.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(task.state(), StageState::Failed);
    }

    #[test]
    fn test_report() {
        let mut task = StageTask::new("r", Stage::Chunker);
        task.attempts = 3;
        task.fail(StageError::WorkerCrashed {
            exit_code: 1,
            output: "boom".into(),
        })
        .unwrap();
        let report = task.report();
        assert_eq!(report.state, StageState::Failed);
        assert_eq!(report.attempts, 3);
        assert!(report.error.unwrap().starts_with("WorkerCrashed"));
    }
}
