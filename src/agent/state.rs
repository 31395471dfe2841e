use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl AgentState {
    pub fn allowed_transitions(&self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Stopped => &[Starting],
            // Starting falls back to Stopped when subscribing fails.
            Starting => &[Running, Stopped],
            Running => &[Stopping],
            Stopping => &[Stopped],
        }
    }

    pub fn can_transition_to(&self, target: AgentState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn transition_to(&mut self, target: AgentState) -> Result<()> {
        if !self.can_transition_to(target) {
            return Err(MeshError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        *self = target;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(self, AgentState::Running)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_cycle() {
        let mut state = AgentState::default();
        for next in [
            AgentState::Starting,
            AgentState::Running,
            AgentState::Stopping,
            AgentState::Stopped,
            AgentState::Starting,
        ] {
            state.transition_to(next).unwrap();
        }
        assert_eq!(state, AgentState::Starting);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!AgentState::Stopped.can_transition_to(AgentState::Running));
        assert!(!AgentState::Running.can_transition_to(AgentState::Starting));
        assert!(!AgentState::Stopping.can_transition_to(AgentState::Running));

        let mut state = AgentState::Stopped;
        let err = state.transition_to(AgentState::Stopping).unwrap_err();
        assert!(err.to_string().contains("stopped -> stopping"));
        assert_eq!(state, AgentState::Stopped);
    }
}
