//! Agent-to-agent messaging.
//!
//! ```text
//! ┌─────────────┐  send   ┌──────────────┐ a2a.inbox.<target> ┌─────────────┐
//! │  Requester  │────────▶│    Broker    │───────────────────▶│   Target    │
//! │ (pending by │◀────────│              │◀───────────────────│ (dedup, run │
//! │   task_id)  │ result  └──────────────┘ a2a.replies.<src>  │   handler)  │
//! └─────────────┘                                             └─────────────┘
//! ```
//!
//! `task_id` ties a request to its result across retries; `message_id`
//! identifies one delivery and is the dedup key.

mod client;
mod dedup;
mod message;
mod retry;
pub mod topic;

pub use client::{MessagingClient, RequestHandler};
pub use dedup::DedupCache;
pub use message::{
    AGENT_STOPPED, AgentStatus, Envelope, HANDLER_PANIC, Heartbeat, NO_HANDLER, TIMEOUT,
    TRANSPORT, TaskError, TaskRequest, TaskResult, TaskStatus, new_message_id, new_task_id,
};
pub use retry::{ResendIdPolicy, RetryPolicy};
