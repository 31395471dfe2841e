//! Base agent runtime.
//!
//! An agent owns one inbox subscription, one reply subscription and a
//! heartbeat loop:
//!
//! ```text
//!            ┌──────────────────────── BaseAgent ─────────────────────────┐
//! inbox ────▶│ dedup ─▶ gate (max_in_flight) ─▶ HandlerRegistry[intent]   │──▶ result
//! replies ──▶│ dedup ─▶ PendingRequests[task_id] ─▶ send_request_and_wait │
//!            │ heartbeat loop (fixed interval) ───────────────────────────│──▶ a2a.heartbeat
//!            └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lifecycle: `stopped → starting → running → stopping → stopped`.

mod liveness;
mod pending;
mod registry;
mod runtime;
mod state;
mod tool;

pub use liveness::{AgentLiveness, Liveness, LivenessMonitor};
pub use pending::{PendingRequests, PendingWait};
pub use registry::{
    BoxedIntentHandler, HandlerCatalog, HandlerError, HandlerRegistry, IntentHandler, handler_fn,
};
pub use runtime::{AgentBuilder, BaseAgent, Requester};
pub use state::AgentState;
pub use tool::{ToolBackend, ToolError, ToolHandler};
