//! Per-agent messaging façade.
//!
//! Wraps the shared broker with the agent's topic names, retry policy and
//! dedup cache. Inbound requests go through [`MessagingClient::serve_requests`],
//! which enforces the dedup check, the in-flight bound and the reply contract:
//! every admitted request produces exactly one published `TaskResult`. A
//! request's delivery is acknowledged only after its result has been
//! published, so a crash mid-handler leaves it due for redelivery.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::dedup::DedupCache;
use super::message::{
    AgentStatus, Envelope, HANDLER_PANIC, Heartbeat, TaskError, TaskRequest, TaskResult,
};
use super::retry::{ResendIdPolicy, RetryPolicy};
use super::topic;
use crate::broker::{
    Acknowledger, PublishAck, SharedBroker, SubscriptionHandle, acked_handler, topic_handler,
};
use crate::error::Result;

/// Turns one admitted request into its result. Never fails: application
/// errors are expressed as `failed` results.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: TaskRequest) -> TaskResult;
}

#[derive(Clone)]
pub struct MessagingClient {
    agent_id: String,
    broker: SharedBroker,
    retry: RetryPolicy,
    dedup: Arc<DedupCache>,
    /// Message ids admitted but not yet marked; blocks a redelivery racing
    /// the first copy while it is still being processed. Tokens of suppressed
    /// copies are completed together with the first copy.
    claimed: Arc<Mutex<HashMap<String, Vec<Acknowledger>>>>,
}

impl MessagingClient {
    pub fn new(
        agent_id: impl Into<String>,
        broker: SharedBroker,
        retry: RetryPolicy,
        dedup: Arc<DedupCache>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            broker,
            retry,
            dedup,
            claimed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    /// Publishes a request to the target's inbox, retrying transport failures.
    pub async fn send(&self, request: TaskRequest) -> Result<PublishAck> {
        request.validate()?;
        let topic = topic::inbox(&request.target_agent);
        debug!(
            agent = %self.agent_id,
            target = %request.target_agent,
            task_id = %request.task_id,
            intent = %request.intent,
            "Sending request"
        );
        self.publish_with_retry(&topic, request.into(), "send_request")
            .await
    }

    /// Publishes a result to the requester's reply topic.
    pub async fn send_result(&self, requester: &str, result: TaskResult) -> Result<PublishAck> {
        result.validate()?;
        let topic = topic::replies(requester);
        self.publish_with_retry(&topic, result.into(), "send_result")
            .await
    }

    /// Single attempt; the next tick supersedes a lost heartbeat.
    pub async fn publish_heartbeat(&self, status: AgentStatus) -> Result<PublishAck> {
        let heartbeat = Heartbeat::new(&self.agent_id, status);
        heartbeat.validate()?;
        self.broker
            .publish(topic::HEARTBEAT_TOPIC, heartbeat.into())
            .await
    }

    async fn publish_with_retry(
        &self,
        topic: &str,
        envelope: Envelope,
        label: &str,
    ) -> Result<PublishAck> {
        let fresh = self.retry.resend_id == ResendIdPolicy::Fresh;
        self.retry
            .run(label, |attempt| {
                let envelope = if fresh && attempt > 1 {
                    envelope.clone().with_fresh_message_id()
                } else {
                    envelope.clone()
                };
                let broker = Arc::clone(&self.broker);
                let topic = topic.to_string();
                async move { broker.publish(&topic, envelope).await }
            })
            .await
    }

    /// Subscribes the agent's inbox.
    ///
    /// A request is admitted only after a permit from `gate` is acquired, so
    /// with K permits at most K handlers run and further requests wait in the
    /// subscription queue.
    pub async fn serve_requests(
        &self,
        handler: Arc<dyn RequestHandler>,
        gate: Arc<Semaphore>,
    ) -> Result<SubscriptionHandle> {
        let client = self.clone();
        let on_envelope = acked_handler(move |envelope: Envelope, ack: Acknowledger| {
            let client = client.clone();
            let handler = Arc::clone(&handler);
            let gate = Arc::clone(&gate);
            async move {
                client.admit(envelope, ack, handler, gate).await;
                Ok(())
            }
        });
        self.broker
            .subscribe(&topic::inbox(&self.agent_id), on_envelope)
            .await
    }

    async fn admit(
        &self,
        envelope: Envelope,
        ack: Acknowledger,
        handler: Arc<dyn RequestHandler>,
        gate: Arc<Semaphore>,
    ) {
        let kind = envelope.kind();
        let Envelope::TaskRequest(request) = envelope else {
            debug!(agent = %self.agent_id, kind, "Ignoring non-request on inbox");
            ack.complete();
            return;
        };
        if let Err(e) = request.validate() {
            warn!(agent = %self.agent_id, error = %e, "Dropping malformed request");
            ack.complete();
            return;
        }
        let Some(ack) = self.claim(&request.message_id, ack) else {
            debug!(
                agent = %self.agent_id,
                message_id = %request.message_id,
                task_id = %request.task_id,
                "Duplicate request suppressed"
            );
            return;
        };

        let permit = match gate.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Gate closed: the agent is shutting down. The claim is
                // released unacknowledged so a redelivery after restart is
                // processed.
                self.claimed.lock().remove(&request.message_id);
                debug!(agent = %self.agent_id, task_id = %request.task_id, "Request left for redelivery");
                return;
            }
        };

        let client = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            client.process(request, handler, ack).await;
        });
    }

    /// Returns the token back when `message_id` is new. A copy of a finished
    /// request is acknowledged at once; a copy of one still in progress is
    /// parked until the first copy finishes.
    fn claim(&self, message_id: &str, ack: Acknowledger) -> Option<Acknowledger> {
        let mut claimed = self.claimed.lock();
        // Checked before the dedup cache: an id is marked seen slightly
        // before its claim is released.
        if let Some(parked) = claimed.get_mut(message_id) {
            parked.push(ack);
            return None;
        }
        if self.dedup.seen(message_id) {
            drop(claimed);
            ack.complete();
            return None;
        }
        claimed.insert(message_id.to_string(), Vec::new());
        Some(ack)
    }

    async fn process(
        &self,
        request: TaskRequest,
        handler: Arc<dyn RequestHandler>,
        ack: Acknowledger,
    ) {
        let message_id = request.message_id.clone();
        let task_id = request.task_id.clone();
        let requester = request.source_agent.clone();
        let intent = request.intent.clone();
        let started = Instant::now();

        let result = match AssertUnwindSafe(handler.handle_request(request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(agent = %self.agent_id, task_id = %task_id, intent = %intent, panic = %message, "Handler panicked");
                TaskResult::failed(&task_id, TaskError::new(HANDLER_PANIC, message))
            }
        };

        self.dedup.mark(&message_id);
        let parked = self.claimed.lock().remove(&message_id).unwrap_or_default();

        debug!(
            agent = %self.agent_id,
            task_id = %task_id,
            intent = %intent,
            status = %result.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request processed"
        );

        if let Err(e) = self.send_result(&requester, result).await {
            error!(agent = %self.agent_id, task_id = %task_id, requester = %requester, error = %e, "Failed to publish result");
        }

        ack.complete();
        for copy in parked {
            copy.complete();
        }
    }

    /// Subscribes the agent's reply topic; `on_result` sees each result once.
    pub async fn on_results<F>(&self, on_result: F) -> Result<SubscriptionHandle>
    where
        F: Fn(TaskResult) + Send + Sync + 'static,
    {
        let dedup = Arc::clone(&self.dedup);
        let agent_id = self.agent_id.clone();
        let on_result = Arc::new(on_result);
        let handler = topic_handler(move |envelope: Envelope| {
            let dedup = Arc::clone(&dedup);
            let on_result = Arc::clone(&on_result);
            let agent_id = agent_id.clone();
            async move {
                let Envelope::TaskResult(result) = envelope else {
                    return Ok(());
                };
                if dedup.seen(&result.message_id) {
                    debug!(agent = %agent_id, task_id = %result.task_id, "Duplicate result suppressed");
                    return Ok(());
                }
                let message_id = result.message_id.clone();
                on_result(result);
                dedup.mark(&message_id);
                Ok(())
            }
        });
        self.broker
            .subscribe(&topic::replies(&self.agent_id), handler)
            .await
    }

    pub async fn on_heartbeats<F>(&self, on_heartbeat: F) -> Result<SubscriptionHandle>
    where
        F: Fn(Heartbeat) + Send + Sync + 'static,
    {
        let on_heartbeat = Arc::new(on_heartbeat);
        let handler = topic_handler(move |envelope: Envelope| {
            let on_heartbeat = Arc::clone(&on_heartbeat);
            async move {
                if let Envelope::Heartbeat(heartbeat) = envelope {
                    on_heartbeat(heartbeat);
                }
                Ok(())
            }
        });
        self.broker
            .subscribe(topic::HEARTBEAT_TOPIC, handler)
            .await
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        self.broker.unsubscribe(handle).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
