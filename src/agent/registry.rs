//! Intent to handler registry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::config::AgentProfile;
use crate::error::{MeshError, Result};
use crate::messaging::{TaskError, TaskRequest};

/// Application-level failure returned by a handler; becomes a `failed` result.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub code: String,
    pub message: String,
    pub detail: Option<Value>,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new("invalid_payload", message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<HandlerError> for TaskError {
    fn from(value: HandlerError) -> Self {
        TaskError {
            code: value.code,
            message: value.message,
            detail: value.detail,
        }
    }
}

/// Payload in, output or failure out.
#[async_trait]
pub trait IntentHandler: Send + Sync {
    async fn handle(&self, request: &TaskRequest) -> std::result::Result<Value, HandlerError>;
}

pub type BoxedIntentHandler = Arc<dyn IntentHandler>;

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> IntentHandler for FnHandler<F>
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: &TaskRequest) -> std::result::Result<Value, HandlerError> {
        (self.0)(request.clone()).await
    }
}

/// Adapts an async closure into an [`IntentHandler`].
pub fn handler_fn<F, Fut>(f: F) -> BoxedIntentHandler
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

pub(crate) fn validate_intent(intent: &str) -> Result<()> {
    if intent.is_empty() || intent.chars().any(char::is_whitespace) {
        return Err(MeshError::InvalidIntent(intent.to_string()));
    }
    Ok(())
}

/// Handlers registered on one agent, keyed by intent.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, BoxedIntentHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("intents", &self.intents())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, intent: impl Into<String>, handler: BoxedIntentHandler) -> Result<()> {
        let intent = intent.into();
        validate_intent(&intent)?;

        let mut handlers = self.handlers.write();
        if handlers.contains_key(&intent) {
            return Err(MeshError::DuplicateIntent(intent));
        }
        handlers.insert(intent, handler);
        Ok(())
    }

    pub fn get(&self, intent: &str) -> Option<BoxedIntentHandler> {
        self.handlers.read().get(intent).cloned()
    }

    pub fn contains(&self, intent: &str) -> bool {
        self.handlers.read().contains_key(intent)
    }

    pub fn intents(&self) -> Vec<String> {
        let mut intents: Vec<String> = self.handlers.read().keys().cloned().collect();
        intents.sort();
        intents
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Implementations available to a process, from which agent profiles pick
/// their intents.
#[derive(Default, Clone)]
pub struct HandlerCatalog {
    implementations: HashMap<String, BoxedIntentHandler>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, intent: impl Into<String>, handler: BoxedIntentHandler) -> Self {
        self.insert(intent, handler);
        self
    }

    pub fn insert(&mut self, intent: impl Into<String>, handler: BoxedIntentHandler) {
        self.implementations.insert(intent.into(), handler);
    }

    pub fn get(&self, intent: &str) -> Option<BoxedIntentHandler> {
        self.implementations.get(intent).cloned()
    }

    /// Builds the registry for one `[[agents]]` row.
    pub fn registry_for(&self, profile: &AgentProfile) -> Result<HandlerRegistry> {
        let registry = HandlerRegistry::new();
        let mut missing = Vec::new();
        for intent in &profile.intents {
            match self.get(intent) {
                Some(handler) => registry.register(intent.clone(), handler)?,
                None => missing.push(intent.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(MeshError::Config(format!(
                "agent '{}' lists intents with no implementation: {}",
                profile.id,
                missing.join(", ")
            )));
        }
        Ok(registry)
    }
}
