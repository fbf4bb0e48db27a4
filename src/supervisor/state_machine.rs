use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of a supervised process.
///
/// `Running` means the process was launched but has not reported readiness
/// (for the tunnel it means "connected"). `Ready` is only reached by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Ready,
    Stopping,
}

impl SupervisorState {
    /// Launched and not yet observed to exit or announce shutdown.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Ready)
    }
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(SupervisorState, SupervisorState),
}

pub struct StateMachine {
    state: SupervisorState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: SupervisorState::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn can_transition(&self, to: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self.state, to),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Idle)
                | (Running, Ready)
                | (Running, Stopping)
                | (Running, Idle)
                | (Ready, Stopping)
                | (Ready, Idle)
                | (Stopping, Idle)
        )
    }

    pub fn transition(&mut self, to: SupervisorState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }

    /// Return to `Idle` from wherever we are. Used when the process is gone.
    pub fn reset(&mut self) -> bool {
        if self.state == SupervisorState::Idle {
            return false;
        }
        tracing::debug!("State transition: {:?} -> Idle (reset)", self.state);
        self.state = SupervisorState::Idle;
        true
    }
}
