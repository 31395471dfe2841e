//! Base agent runtime: lifecycle, intent dispatch, request/await correlation
//! and the heartbeat loop.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pending::PendingRequests;
use super::registry::{BoxedIntentHandler, HandlerCatalog, HandlerRegistry, validate_intent};
use super::state::AgentState;
use crate::broker::{SharedBroker, SubscriptionHandle};
use crate::config::{AgentConfig, AgentProfile, MeshConfig};
use crate::error::{MeshError, Result};
use crate::messaging::{
    AGENT_STOPPED, AgentStatus, DedupCache, MessagingClient, RequestHandler, RetryPolicy,
    TaskError, TaskRequest, TaskResult,
};

/// Consecutive heartbeat publish failures before escalating to an error log.
const HEARTBEAT_FAILURE_WARN: u32 = 3;

pub struct AgentBuilder {
    id: String,
    broker: SharedBroker,
    registry: HandlerRegistry,
    config: AgentConfig,
    retry: RetryPolicy,
    dedup: Option<DedupCache>,
}

impl AgentBuilder {
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dedup(mut self, dedup: DedupCache) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn build(self) -> Result<BaseAgent> {
        validate_intent(&self.id).map_err(|_| {
            MeshError::Config(format!("invalid agent id {:?}", self.id))
        })?;
        if self.config.max_in_flight == 0 {
            return Err(MeshError::Config(format!(
                "agent '{}': max_in_flight must be greater than 0",
                self.id
            )));
        }

        let dedup = Arc::new(
            self.dedup
                .unwrap_or_else(|| DedupCache::from_config(&Default::default())),
        );
        let client = MessagingClient::new(&self.id, self.broker, self.retry, dedup);
        let gate = Arc::new(Semaphore::new(self.config.max_in_flight));

        Ok(BaseAgent {
            inner: Arc::new(AgentInner {
                id: self.id,
                config: self.config,
                client,
                registry: Arc::new(self.registry),
                pending: Arc::new(PendingRequests::new()),
                state: parking_lot::Mutex::new(AgentState::Stopped),
                gate,
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        })
    }
}

#[derive(Default)]
struct Lifecycle {
    inbox: Option<SubscriptionHandle>,
    replies: Option<SubscriptionHandle>,
    heartbeat_stop: Option<watch::Sender<bool>>,
    heartbeat: Option<JoinHandle<()>>,
}

struct AgentInner {
    id: String,
    config: AgentConfig,
    client: MessagingClient,
    registry: Arc<HandlerRegistry>,
    pending: Arc<PendingRequests>,
    state: parking_lot::Mutex<AgentState>,
    /// One permit per concurrently running handler.
    gate: Arc<Semaphore>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// An agent instance. Cheap to clone; clones share the same runtime.
#[derive(Clone)]
pub struct BaseAgent {
    inner: Arc<AgentInner>,
}

impl BaseAgent {
    pub fn builder(id: impl Into<String>, broker: SharedBroker) -> AgentBuilder {
        AgentBuilder {
            id: id.into(),
            broker,
            registry: HandlerRegistry::new(),
            config: AgentConfig::default(),
            retry: RetryPolicy::default(),
            dedup: None,
        }
    }

    /// Builds an agent from one `[[agents]]` row, resolving its intents in `catalog`.
    pub fn from_profile(
        profile: &AgentProfile,
        catalog: &HandlerCatalog,
        broker: SharedBroker,
        config: &MeshConfig,
    ) -> Result<Self> {
        Self::builder(&profile.id, broker)
            .registry(catalog.registry_for(profile)?)
            .config(config.agent.for_profile(profile))
            .retry(RetryPolicy::from_config(&config.retry))
            .dedup(DedupCache::from_config(&config.dedup))
            .build()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn register(&self, intent: impl Into<String>, handler: BoxedIntentHandler) -> Result<()> {
        self.inner.registry.register(intent, handler)
    }

    pub fn client(&self) -> &MessagingClient {
        &self.inner.client
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Handlers currently executing.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn requester(&self) -> Requester {
        Requester {
            agent_id: self.inner.id.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribes the reply and inbox topics and starts the heartbeat loop.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.state.lock().transition_to(AgentState::Starting)?;

        if let Err(e) = self.attach(&mut lifecycle).await {
            error!(agent = %self.inner.id, error = %e, "Agent failed to start");
            self.detach(&mut lifecycle).await;
            self.inner.state.lock().transition_to(AgentState::Stopped)?;
            return Err(e);
        }

        self.inner.state.lock().transition_to(AgentState::Running)?;
        info!(
            agent = %self.inner.id,
            intents = ?self.inner.registry.intents(),
            max_in_flight = self.inner.config.max_in_flight,
            "Agent started"
        );
        Ok(())
    }

    async fn attach(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let pending = Arc::clone(&self.inner.pending);
        lifecycle.replies = Some(
            self.inner
                .client
                .on_results(move |result| {
                    pending.fulfill(result);
                })
                .await?,
        );

        let dispatch: Arc<dyn RequestHandler> = Arc::new(IntentDispatch {
            agent_id: self.inner.id.clone(),
            registry: Arc::clone(&self.inner.registry),
        });
        lifecycle.inbox = Some(
            self.inner
                .client
                .serve_requests(dispatch, Arc::clone(&self.inner.gate))
                .await?,
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.config.heartbeat_interval();
        lifecycle.heartbeat = Some(tokio::spawn(heartbeat_loop(inner, interval, stop_rx)));
        lifecycle.heartbeat_stop = Some(stop_tx);
        Ok(())
    }

    async fn detach(&self, lifecycle: &mut Lifecycle) {
        if let Some(handle) = lifecycle.inbox.take()
            && let Err(e) = self.inner.client.unsubscribe(&handle).await
        {
            warn!(agent = %self.inner.id, error = %e, "Failed to unsubscribe inbox");
        }
        if let Some(stop) = lifecycle.heartbeat_stop.take() {
            let _ = stop.send(true);
        }
        if let Some(handle) = lifecycle.heartbeat.take() {
            let _ = handle.await;
        }
        if let Some(handle) = lifecycle.replies.take()
            && let Err(e) = self.inner.client.unsubscribe(&handle).await
        {
            warn!(agent = %self.inner.id, error = %e, "Failed to unsubscribe replies");
        }
    }

    /// Stops accepting requests, stops the heartbeat, drains in-flight
    /// handlers (bounded by `drain_timeout_ms`) and fails outstanding waits.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.state.lock().transition_to(AgentState::Stopping)?;
        info!(agent = %self.inner.id, in_flight = self.in_flight(), "Agent stopping");

        if let Some(handle) = lifecycle.inbox.take()
            && let Err(e) = self.inner.client.unsubscribe(&handle).await
        {
            warn!(agent = %self.inner.id, error = %e, "Failed to unsubscribe inbox");
        }
        if let Some(stop) = lifecycle.heartbeat_stop.take() {
            let _ = stop.send(true);
        }
        if let Some(handle) = lifecycle.heartbeat.take() {
            let _ = handle.await;
        }

        self.drain().await;

        let cancelled = self.inner.pending.cancel_all(|task_id| {
            TaskResult::failed(
                task_id,
                TaskError::new(AGENT_STOPPED, format!("agent {} stopped", self.inner.id)),
            )
        });
        if cancelled > 0 {
            debug!(agent = %self.inner.id, cancelled, "Cancelled pending requests");
        }

        self.detach(&mut lifecycle).await;
        self.inner.state.lock().transition_to(AgentState::Stopped)?;
        info!(agent = %self.inner.id, "Agent stopped");
        Ok(())
    }

    async fn drain(&self) {
        let permits = self.inner.config.max_in_flight as u32;
        let timeout = self.inner.config.drain_timeout();
        match tokio::time::timeout(timeout, self.inner.gate.acquire_many(permits)).await {
            Ok(Ok(all)) => drop(all),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                agent = %self.inner.id,
                in_flight = self.in_flight(),
                timeout_ms = timeout.as_millis() as u64,
                "Drain timed out, handlers keep running in the background"
            ),
        }
    }

    /// Sends a request and waits for its result or the deadline.
    ///
    /// Only the calling task waits; the agent keeps serving its inbox and
    /// heartbeat. On deadline the pending entry is evicted and a synthetic
    /// `timeout` result is returned. Transport failures that survive the
    /// retry policy are returned as errors.
    pub async fn send_request_and_wait(
        &self,
        target: &str,
        intent: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<TaskResult> {
        self.inner
            .request_and_wait(target, intent, payload, timeout)
            .await
    }

    /// [`send_request_and_wait`](Self::send_request_and_wait) with the
    /// configured default timeout.
    pub async fn request(&self, target: &str, intent: &str, payload: Value) -> Result<TaskResult> {
        let timeout = self.inner.config.default_request_timeout();
        self.send_request_and_wait(target, intent, payload, timeout)
            .await
    }
}

impl AgentInner {
    fn in_flight(&self) -> usize {
        self.config
            .max_in_flight
            .saturating_sub(self.gate.available_permits())
    }

    fn heartbeat_status(&self) -> AgentStatus {
        match *self.state.lock() {
            AgentState::Starting => AgentStatus::Starting,
            AgentState::Stopping | AgentState::Stopped => AgentStatus::Stopping,
            AgentState::Running if self.in_flight() > 0 => AgentStatus::Busy,
            AgentState::Running => AgentStatus::Idle,
        }
    }

    async fn request_and_wait(
        &self,
        target: &str,
        intent: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let state = *self.state.lock();
        // Stopping still allows requests so draining handlers can finish.
        if !matches!(state, AgentState::Running | AgentState::Stopping) {
            return Err(MeshError::AgentNotRunning(self.id.clone()));
        }

        let request = TaskRequest::new(&self.id, target, intent, payload);
        request.validate()?;
        let task_id = request.task_id.clone();
        let timeout_ms = timeout.as_millis() as u64;
        let started = Instant::now();

        let wait = self.pending.register(&task_id, timeout)?;
        let deadline = tokio::time::Instant::from_std(wait.deadline());

        match tokio::time::timeout_at(deadline, self.client.send(request)).await {
            Ok(Ok(ack)) => {
                debug!(agent = %self.id, to = target, intent, task_id = %task_id, deliveries = ack.deliveries, "Request sent");
            }
            Ok(Err(e)) => {
                warn!(agent = %self.id, to = target, intent, task_id = %task_id, error = %e, "Request could not be sent");
                return Err(e);
            }
            Err(_) => {
                warn!(agent = %self.id, to = target, intent, task_id = %task_id, timeout_ms, "Deadline passed while sending");
                return Ok(TaskResult::timeout(task_id, timeout_ms));
            }
        }

        match wait.wait().await {
            Some(result) => {
                debug!(
                    agent = %self.id,
                    task_id = %task_id,
                    status = %result.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Result received"
                );
                Ok(result)
            }
            None => {
                warn!(agent = %self.id, to = target, intent, task_id = %task_id, timeout_ms, "Request timed out");
                Ok(TaskResult::timeout(task_id, timeout_ms))
            }
        }
    }
}

/// Weak handle for issuing requests on behalf of an agent from inside its
/// own handlers.
#[derive(Clone)]
pub struct Requester {
    agent_id: String,
    inner: Weak<AgentInner>,
}

impl Requester {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn send_request_and_wait(
        &self,
        target: &str,
        intent: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(MeshError::AgentNotRunning(self.agent_id.clone()));
        };
        inner
            .request_and_wait(target, intent, payload, timeout)
            .await
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.inner
            .upgrade()
            .map(|inner| inner.config.default_request_timeout())
    }
}

struct IntentDispatch {
    agent_id: String,
    registry: Arc<HandlerRegistry>,
}

#[async_trait]
impl RequestHandler for IntentDispatch {
    async fn handle_request(&self, request: TaskRequest) -> TaskResult {
        let Some(handler) = self.registry.get(&request.intent) else {
            warn!(agent = %self.agent_id, intent = %request.intent, task_id = %request.task_id, "No handler for intent");
            return TaskResult::no_handler(&request.task_id, &request.intent);
        };

        match handler.handle(&request).await {
            Ok(output) => TaskResult::completed(&request.task_id, output),
            Err(e) => {
                warn!(agent = %self.agent_id, intent = %request.intent, task_id = %request.task_id, error = %e, "Handler failed");
                TaskResult::failed(&request.task_id, e.into())
            }
        }
    }
}

async fn heartbeat_loop(
    inner: Weak<AgentInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consecutive_failures: u32 = 0;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(agent) = inner.upgrade() else {
                    break;
                };
                let status = agent.heartbeat_status();
                match agent.client.publish_heartbeat(status).await {
                    Ok(_) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(agent = %agent.id, error = %e, consecutive_failures, "Heartbeat publish failed");
                        if consecutive_failures == HEARTBEAT_FAILURE_WARN {
                            error!(agent = %agent.id, "Heartbeats failing repeatedly, agent will look stale");
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Heartbeat loop shutdown");
                    break;
                }
            }
        }
    }
}
