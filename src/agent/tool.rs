//! Boundary to synchronous tool backends (ticket, document, search lookups).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::registry::{HandlerError, IntentHandler};
use crate::messaging::TaskRequest;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Tool failed: {0}")]
    Failed(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidParams(_) => "invalid_payload",
            Self::Failed(_) => "tool_failed",
        }
    }
}

/// Blocking call into an external tool.
pub trait ToolBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn invoke(&self, params: &Value) -> Result<Value, ToolError>;
}

/// Runs a [`ToolBackend`] on the blocking pool under a timeout and turns
/// every tool outcome into a handler result.
pub struct ToolHandler {
    backend: Arc<dyn ToolBackend>,
    timeout: Duration,
}

impl ToolHandler {
    pub fn new(backend: Arc<dyn ToolBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn shared(backend: Arc<dyn ToolBackend>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(backend, timeout))
    }
}

#[async_trait]
impl IntentHandler for ToolHandler {
    async fn handle(&self, request: &TaskRequest) -> Result<Value, HandlerError> {
        let backend = Arc::clone(&self.backend);
        let params = request.payload.clone();
        let call = tokio::task::spawn_blocking(move || backend.invoke(&params));

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => {
                warn!(tool = self.backend.name(), task_id = %request.task_id, error = %e, "Tool call failed");
                Err(HandlerError::new(e.code(), e.to_string()))
            }
            Ok(Err(join)) => Err(HandlerError::new(
                "tool_crashed",
                format!("{} crashed: {}", self.backend.name(), join),
            )),
            Err(_) => {
                warn!(tool = self.backend.name(), task_id = %request.task_id, timeout_ms = self.timeout.as_millis() as u64, "Tool call timed out");
                Err(HandlerError::new(
                    "tool_timeout",
                    format!(
                        "{} did not answer within {}ms",
                        self.backend.name(),
                        self.timeout.as_millis()
                    ),
                ))
            }
        }
    }
}
