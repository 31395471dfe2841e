//! Configuration types and loading.
//!
//! `MeshConfig` is the top-level TOML document:
//! - `broker`: transport selection and relay connection parameters
//! - `retry`, `dedup`: delivery guarantees
//! - `agent`, `liveness`: runtime tuning
//! - `agents`, `workflows`: handler registration table and declared workflow graphs

mod settings;

pub use settings::{
    AgentConfig, AgentProfile, BrokerConfig, DedupConfig, LivenessConfig, MeshConfig,
    RetryConfig, TransportKind,
};
