//! Heartbeat consumer. Observational only: it reports staleness but never
//! changes routing or cancels requests.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::broker::SubscriptionHandle;
use crate::config::LivenessConfig;
use crate::error::Result;
use crate::messaging::{AgentStatus, Heartbeat, MessagingClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Stale,
    Unknown,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Alive => "alive",
            Self::Stale => "stale",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentLiveness {
    pub agent_id: String,
    pub status: AgentStatus,
    pub liveness: Liveness,
    pub last_seen_ms: u64,
}

struct Observation {
    status: AgentStatus,
    received_at: Instant,
}

pub struct LivenessMonitor {
    stale_after: Duration,
    observations: DashMap<String, Observation>,
}

impl LivenessMonitor {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            observations: DashMap::new(),
        }
    }

    pub fn from_config(config: &LivenessConfig) -> Self {
        Self::new(config.stale_after())
    }

    /// Starts consuming the shared heartbeat topic through `client`.
    pub async fn attach(self: &Arc<Self>, client: &MessagingClient) -> Result<SubscriptionHandle> {
        let monitor = Arc::clone(self);
        client
            .on_heartbeats(move |heartbeat| monitor.record(heartbeat))
            .await
    }

    /// Ages are measured from local receipt, not the sender's clock.
    pub fn record(&self, heartbeat: Heartbeat) {
        self.record_at(heartbeat, Instant::now());
    }

    pub(crate) fn record_at(&self, heartbeat: Heartbeat, received_at: Instant) {
        debug!(agent = %heartbeat.agent_id, status = %heartbeat.status, "Heartbeat");
        self.observations.insert(
            heartbeat.agent_id,
            Observation {
                status: heartbeat.status,
                received_at,
            },
        );
    }

    pub fn liveness(&self, agent_id: &str) -> Liveness {
        match self.observations.get(agent_id) {
            Some(obs) if obs.received_at.elapsed() <= self.stale_after => Liveness::Alive,
            Some(_) => Liveness::Stale,
            None => Liveness::Unknown,
        }
    }

    pub fn last_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.observations.get(agent_id).map(|obs| obs.status)
    }

    pub fn snapshot(&self) -> Vec<AgentLiveness> {
        let mut agents: Vec<AgentLiveness> = self
            .observations
            .iter()
            .map(|entry| {
                let age = entry.received_at.elapsed();
                AgentLiveness {
                    agent_id: entry.key().clone(),
                    status: entry.status,
                    liveness: if age <= self.stale_after {
                        Liveness::Alive
                    } else {
                        Liveness::Stale
                    },
                    last_seen_ms: age.as_millis() as u64,
                }
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }
}
