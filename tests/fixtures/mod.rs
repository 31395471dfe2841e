//! Shared helpers for integration tests: fast runtime settings and handlers
//! that record what they were asked to do.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use a2a_mesh::agent::{BaseAgent, HandlerError, IntentHandler};
use a2a_mesh::broker::SharedBroker;
use a2a_mesh::config::AgentConfig;
use a2a_mesh::messaging::{RetryPolicy, TaskRequest};

pub fn fast_config() -> AgentConfig {
    AgentConfig {
        heartbeat_interval_ms: 50,
        default_request_timeout_ms: 2000,
        max_in_flight: 4,
        drain_timeout_ms: 500,
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        ..RetryPolicy::default()
    }
}

/// Builds and starts an agent serving `handlers`.
pub async fn spawn_agent(
    broker: &SharedBroker,
    id: &str,
    config: AgentConfig,
    handlers: Vec<(&str, Arc<dyn IntentHandler>)>,
) -> BaseAgent {
    let agent = BaseAgent::builder(id, Arc::clone(broker))
        .config(config)
        .retry(fast_retry())
        .build()
        .unwrap();
    for (intent, handler) in handlers {
        agent.register(intent, handler).unwrap();
    }
    agent.start().await.unwrap();
    agent
}

/// Records every invocation and answers with a fixed output after `delay`.
pub struct Recorder {
    output: Value,
    delay: Duration,
    calls: Mutex<Vec<TaskRequest>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    pub fn new(output: Value) -> Arc<Self> {
        Self::with_delay(output, Duration::ZERO)
    }

    pub fn with_delay(output: Value, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            output,
            delay,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<TaskRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_per_task(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for call in self.calls.lock().iter() {
            *counts.entry(call.task_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Highest number of invocations observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntentHandler for Recorder {
    async fn handle(&self, request: &TaskRequest) -> Result<Value, HandlerError> {
        self.calls.lock().push(request.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// Echoes the request payload back as output.
pub struct Echo;

#[async_trait]
impl IntentHandler for Echo {
    async fn handle(&self, request: &TaskRequest) -> Result<Value, HandlerError> {
        Ok(json!({ "echo": request.payload }))
    }
}

/// Panics on every call, like a crashing tool layer.
pub struct Panicking;

#[async_trait]
impl IntentHandler for Panicking {
    async fn handle(&self, _request: &TaskRequest) -> Result<Value, HandlerError> {
        panic!("tool layer crashed");
    }
}
