use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{MeshError, Result};
use crate::messaging::ResendIdPolicy;
use crate::orchestration::{WorkflowSpec, research};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub broker: BrokerConfig,
    pub retry: RetryConfig,
    pub dedup: DedupConfig,
    pub agent: AgentConfig,
    pub liveness: LivenessConfig,
    pub agents: Vec<AgentProfile>,
    pub workflows: Vec<WorkflowSpec>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            retry: RetryConfig::default(),
            dedup: DedupConfig::default(),
            agent: AgentConfig::default(),
            liveness: LivenessConfig::default(),
            agents: research::default_profiles(),
            workflows: vec![research::research_workflow()],
        }
    }
}

impl MeshConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| MeshError::Config(e.to_string()))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn profile(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|p| p.id == agent_id)
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowSpec> {
        self.workflows.iter().find(|w| w.name == name)
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Broker
        if self.broker.transport == TransportKind::Network {
            if self.broker.relay_addr.trim().is_empty() {
                errors.push("broker.relay_addr must be set for the network transport".into());
            }
            if self.broker.client_id.trim().is_empty() {
                errors.push("broker.client_id must be set for the network transport".into());
            } else if self.broker.client_id == DEFAULT_CLIENT_ID {
                errors.push(format!(
                    "broker.client_id must name this process for the network transport, not the default '{}'",
                    DEFAULT_CLIENT_ID
                ));
            }
        }
        if self.broker.publish_timeout_ms == 0 {
            errors.push("broker.publish_timeout_ms must be greater than 0".into());
        }
        if self.broker.connect_timeout_ms == 0 {
            errors.push("broker.connect_timeout_ms must be greater than 0".into());
        }
        if self.broker.retention == 0 {
            errors.push("broker.retention must be greater than 0".into());
        }

        // Retry
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be greater than 0".into());
        }
        if self.retry.multiplier < 1.0 {
            errors.push("retry.multiplier must be >= 1.0".into());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("retry.max_delay_ms must be >= retry.base_delay_ms".into());
        }

        // Dedup
        if self.dedup.capacity == 0 {
            errors.push("dedup.capacity must be greater than 0".into());
        }
        if self.dedup.retention_secs == 0 {
            errors.push("dedup.retention_secs must be greater than 0".into());
        }

        // Agent runtime
        if self.agent.heartbeat_interval_ms == 0 {
            errors.push("agent.heartbeat_interval_ms must be greater than 0".into());
        }
        if self.agent.default_request_timeout_ms == 0 {
            errors.push("agent.default_request_timeout_ms must be greater than 0".into());
        }
        if self.agent.max_in_flight == 0 {
            errors.push("agent.max_in_flight must be greater than 0".into());
        }
        if self.liveness.stale_after_ms <= self.agent.heartbeat_interval_ms {
            errors.push("liveness.stale_after_ms must exceed agent.heartbeat_interval_ms".into());
        }

        // Handler registration table
        let mut ids = HashSet::new();
        for profile in &self.agents {
            if profile.id.trim().is_empty() {
                errors.push("agents[].id must not be empty".into());
            } else if !ids.insert(profile.id.as_str()) {
                errors.push(format!("agents: duplicate agent id '{}'", profile.id));
            }
            if profile.max_in_flight == Some(0) {
                errors.push(format!(
                    "agents.{}.max_in_flight must be greater than 0",
                    profile.id
                ));
            }
            let mut intents = HashSet::new();
            for intent in &profile.intents {
                if !intents.insert(intent.as_str()) {
                    errors.push(format!(
                        "agents.{}: intent '{}' listed twice",
                        profile.id, intent
                    ));
                }
            }
        }

        // Workflows
        let mut names = HashSet::new();
        for workflow in &self.workflows {
            if !names.insert(workflow.name.as_str()) {
                errors.push(format!("workflows: duplicate name '{}'", workflow.name));
            }
            if let Err(e) = workflow.validate() {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process fan-out; state is lost with the process.
    #[default]
    Volatile,
    /// TCP relay with a retained per-topic log.
    Network,
}

/// Placeholder identity; processes sharing it would share relay cursors.
pub const DEFAULT_CLIENT_ID: &str = "a2a-mesh";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub transport: TransportKind,
    /// Address of the relay (network transport) or bind address (`relay` command).
    pub relay_addr: String,
    /// Stable consumer identity, unique per process; the relay resumes
    /// subscriptions under this name.
    pub client_id: String,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Messages retained per topic by the relay for replay.
    pub retention: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Volatile,
            relay_addr: String::from("127.0.0.1:7450"),
            client_id: String::from(DEFAULT_CLIENT_ID),
            connect_timeout_ms: 2000,
            publish_timeout_ms: 2000,
            reconnect_delay_ms: 500,
            retention: 1024,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub resend_id: ResendIdPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            multiplier: 2.0,
            resend_id: ResendIdPolicy::Reuse,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub capacity: usize,
    /// Must cover the worst-case redelivery delay (relay replay after reconnect).
    pub retention_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            retention_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub heartbeat_interval_ms: u64,
    pub default_request_timeout_ms: u64,
    /// Concurrent handler invocations per agent; further requests wait in the transport.
    pub max_in_flight: usize,
    pub drain_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            default_request_timeout_ms: 30_000,
            max_in_flight: 4,
            drain_timeout_ms: 5000,
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn for_profile(&self, profile: &AgentProfile) -> Self {
        let mut config = self.clone();
        if let Some(max) = profile.max_in_flight {
            config.max_in_flight = max;
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub stale_after_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 6000,
        }
    }
}

impl LivenessConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// One row of the per-agent handler registration table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    pub id: String,
    pub intents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, intents: &[&str]) -> Self {
        Self {
            id: id.into(),
            intents: intents.iter().map(|s| s.to_string()).collect(),
            max_in_flight: None,
        }
    }
}
