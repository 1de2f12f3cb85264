//! Pipeline state machine.
//!
//! Transitions are linear on success. Any failure moves the run straight to
//! [`PipelineState::Failed`] from whichever state is active. No state is
//! entered twice within a run.

use super::StageName;
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// States of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Creating the isolated environment.
    Provisioning,
    /// Installing dependencies.
    InstallingDeps,
    /// Running static checks.
    Verifying,
    /// Running the test suite.
    Testing,
    /// Building archives.
    Building,
    /// Uploading archives.
    Publishing,
    /// Every stage succeeded.
    Succeeded,
    /// A stage failed.
    Failed,
}

impl PipelineState {
    /// The state entered when the current one succeeds.
    #[must_use]
    pub fn successor(&self) -> Option<Self> {
        match self {
            Self::Provisioning => Some(Self::InstallingDeps),
            Self::InstallingDeps => Some(Self::Verifying),
            Self::Verifying => Some(Self::Testing),
            Self::Testing => Some(Self::Building),
            Self::Building => Some(Self::Publishing),
            Self::Publishing => Some(Self::Succeeded),
            Self::Succeeded | Self::Failed => None,
        }
    }

    /// The stage executed in this state, if any.
    #[must_use]
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::Provisioning => Some(StageName::Provision),
            Self::InstallingDeps => Some(StageName::Install),
            Self::Verifying => Some(StageName::Verify),
            Self::Testing => Some(StageName::Test),
            Self::Building => Some(StageName::Build),
            Self::Publishing => Some(StageName::Publish),
            Self::Succeeded | Self::Failed => None,
        }
    }

    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::InstallingDeps => write!(f, "installing_deps"),
            Self::Verifying => write!(f, "verifying"),
            Self::Testing => write!(f, "testing"),
            Self::Building => write!(f, "building"),
            Self::Publishing => write!(f, "publishing"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Tracks the current state and the states visited so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachine {
    current: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Creates a machine in the initial `Provisioning` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: PipelineState::Provisioning,
            history: vec![PipelineState::Provisioning],
        }
    }

    /// The active state.
    #[must_use]
    pub fn current(&self) -> PipelineState {
        self.current
    }

    /// Every state entered, in order.
    #[must_use]
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Checks that `stage` is the one the machine expects to run next.
    ///
    /// # Errors
    ///
    /// Returns an internal error if another stage is active.
    pub fn expect_stage(&self, stage: StageName) -> Result<(), PipelineError> {
        if self.current.stage() == Some(stage) {
            Ok(())
        } else {
            Err(PipelineError::Internal(format!(
                "stage '{stage}' cannot start while the run is {}",
                self.current
            )))
        }
    }

    /// Moves to the successor state after the active stage succeeded.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the machine is already terminal.
    pub fn advance(&mut self) -> Result<PipelineState, PipelineError> {
        let next = self.current.successor().ok_or_else(|| {
            PipelineError::Internal(format!("no transition out of terminal state {}", self.current))
        })?;
        self.enter(next);
        Ok(next)
    }

    /// Moves to `Failed` from any non-terminal state.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the machine is already terminal.
    pub fn fail(&mut self) -> Result<(), PipelineError> {
        if self.current.is_terminal() {
            return Err(PipelineError::Internal(format!(
                "cannot fail a run that is already {}",
                self.current
            )));
        }
        self.enter(PipelineState::Failed);
        Ok(())
    }

    fn enter(&mut self, state: PipelineState) {
        self.current = state;
        self.history.push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_linear() {
        let mut machine = StateMachine::new();
        for stage in StageName::ALL {
            machine.expect_stage(stage).unwrap();
            machine.advance().unwrap();
        }

        assert_eq!(machine.current(), PipelineState::Succeeded);
        assert_eq!(machine.history().len(), 7);
        assert!(machine.advance().is_err());
    }

    #[test]
    fn test_failure_skips_remaining_states() {
        let mut machine = StateMachine::new();
        machine.advance().unwrap();
        machine.advance().unwrap();
        machine.fail().unwrap();

        assert_eq!(
            machine.history(),
            &[
                PipelineState::Provisioning,
                PipelineState::InstallingDeps,
                PipelineState::Verifying,
                PipelineState::Failed,
            ]
        );
        assert!(machine.fail().is_err());
        assert!(machine.advance().is_err());
    }

    #[test]
    fn test_out_of_order_stage_rejected() {
        let machine = StateMachine::new();
        assert!(machine.expect_stage(StageName::Provision).is_ok());
        assert!(machine.expect_stage(StageName::Publish).is_err());
    }

    #[test]
    fn test_no_state_revisited() {
        let mut machine = StateMachine::new();
        while machine.advance().is_ok() {}

        let mut seen = std::collections::HashSet::new();
        assert!(machine.history().iter().all(|s| seen.insert(*s)));
    }
}
