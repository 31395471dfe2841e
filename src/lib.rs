pub mod agent;
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod messaging;
pub mod orchestration;

pub use agent::{AgentState, BaseAgent, HandlerRegistry, IntentHandler, LivenessMonitor};
pub use broker::{Broker, InMemoryBroker, NetworkBroker, RelayServer, SharedBroker};
pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use messaging::{Envelope, Heartbeat, MessagingClient, TaskRequest, TaskResult, TaskStatus};
pub use orchestration::{Manager, WorkflowOutcome, WorkflowSpec, WorkflowStatus};
