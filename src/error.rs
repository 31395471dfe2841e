use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Invalid intent name: {0:?}")]
    InvalidIntent(String),

    #[error("Intent already registered: {0}")]
    DuplicateIntent(String),

    #[error("Invalid agent state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Agent is not running: {0}")]
    AgentNotRunning(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl MeshError {
    /// Transport-level failures are the only errors the sender retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::BrokerUnavailable(_) | Self::Timeout(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MeshError::transport("reset by peer").is_transient());
        assert!(MeshError::BrokerUnavailable("down".into()).is_transient());
        assert!(MeshError::Timeout("ack".into()).is_transient());

        assert!(MeshError::validation("missing task_id").is_permanent());
        assert!(MeshError::DuplicateIntent("search".into()).is_permanent());
        assert!(
            MeshError::RetriesExhausted {
                attempts: 3,
                last_error: "x".into()
            }
            .is_permanent()
        );
    }

    #[test]
    fn test_display() {
        let err = MeshError::InvalidStateTransition {
            from: "stopped".into(),
            to: "stopping".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid agent state transition: stopped -> stopping"
        );
    }
}
