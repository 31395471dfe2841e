//! Manager pattern: one request fanned out over a declared dependency graph.
//!
//! ```text
//!            ┌─▶ tickets ───┐
//! request ───┼─▶ documents ─┼─▶ synthesis ─▶ result
//!            └─▶ search ────┘
//! ```
//!
//! Failure handling is declared per workflow (`default_policy`) and per node
//! (`policy`), never hardcoded in the manager.

mod manager;
pub mod research;
mod workflow;

pub use manager::{Manager, NodeOutcome, NodeStatus, WorkflowHandler, WorkflowOutcome, WorkflowStatus};
pub use workflow::{FailurePolicy, NodeSpec, WorkflowSpec};
