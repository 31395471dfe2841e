//! Demo wiring: every configured agent on one broker, tool intents answered by
//! canned in-process backends.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::agent::{
    AgentLiveness, BaseAgent, HandlerCatalog, LivenessMonitor, ToolBackend, ToolError, ToolHandler,
};
use crate::broker::{self, SharedBroker};
use crate::config::{AgentProfile, MeshConfig};
use crate::error::{MeshError, Result};
use crate::messaging::{DedupCache, RetryPolicy, TaskResult};
use crate::orchestration::research::{
    LOOKUP_TICKETS, RESEARCH_WORKFLOW, RETRIEVE_DOCUMENTS, SYNTHESIZE, SynthesisHandler, WEB_SEARCH,
};
use crate::orchestration::{Manager, WorkflowHandler, WorkflowOutcome};

pub const DEMO_CLIENT: &str = "cli";

const TOOL_TIMEOUT: Duration = Duration::from_millis(500);

const TICKETS: &[(&str, &str, &str)] = &[
    ("T-1042", "Login failures after SSO certificate rotation", "open"),
    ("T-1057", "Password reset email delayed", "resolved"),
    ("T-1063", "Session expires immediately after login", "open"),
    ("T-1071", "Release 2.3 breaks dashboard export", "investigating"),
];

const DOCUMENTS: &[(&str, &str)] = &[
    ("runbooks/sso.md", "Rotating the SSO signing certificate and login recovery"),
    ("releases/2.3.md", "Release notes for 2.3: session handling and export changes"),
    ("guides/passwords.md", "Password reset flow and mail delivery"),
];

fn query_of(params: &Value) -> std::result::Result<String, ToolError> {
    params
        .pointer("/input/query")
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .ok_or_else(|| ToolError::InvalidParams("input.query is required".into()))
}

fn matches(query: &str, text: &str) -> bool {
    let text = text.to_lowercase();
    query
        .split_whitespace()
        .filter(|word| word.len() > 2)
        .any(|word| text.contains(word))
}

pub struct TicketDesk;

impl ToolBackend for TicketDesk {
    fn name(&self) -> &str {
        "ticket-desk"
    }

    fn invoke(&self, params: &Value) -> std::result::Result<Value, ToolError> {
        let query = query_of(params)?;
        let tickets: Vec<Value> = TICKETS
            .iter()
            .filter(|(_, title, _)| matches(&query, title))
            .map(|(id, title, state)| json!({"id": id, "title": title, "state": state}))
            .collect();
        Ok(json!({ "tickets": tickets }))
    }
}

pub struct DocumentStore;

impl ToolBackend for DocumentStore {
    fn name(&self) -> &str {
        "document-store"
    }

    fn invoke(&self, params: &Value) -> std::result::Result<Value, ToolError> {
        let query = query_of(params)?;
        let documents: Vec<Value> = DOCUMENTS
            .iter()
            .filter(|(_, abstract_)| matches(&query, abstract_))
            .map(|(path, abstract_)| json!({"path": path, "abstract": abstract_}))
            .collect();
        Ok(json!({ "documents": documents }))
    }
}

pub struct WebSearch;

impl ToolBackend for WebSearch {
    fn name(&self) -> &str {
        "web-search"
    }

    fn invoke(&self, params: &Value) -> std::result::Result<Value, ToolError> {
        let query = query_of(params)?;
        let slug: String = query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("+");
        Ok(json!({
            "results": [
                {"title": format!("Community thread: {}", query), "url": format!("https://forum.example.com/search?q={}", slug)},
                {"title": "Vendor status page", "url": "https://status.example.com"},
            ]
        }))
    }
}

/// Handlers for every tool intent of the research workflow.
pub fn demo_catalog() -> HandlerCatalog {
    HandlerCatalog::new()
        .with(LOOKUP_TICKETS, ToolHandler::shared(Arc::new(TicketDesk), TOOL_TIMEOUT))
        .with(RETRIEVE_DOCUMENTS, ToolHandler::shared(Arc::new(DocumentStore), TOOL_TIMEOUT))
        .with(WEB_SEARCH, ToolHandler::shared(Arc::new(WebSearch), TOOL_TIMEOUT))
        .with(SYNTHESIZE, Arc::new(SynthesisHandler))
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub result: TaskResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WorkflowOutcome>,
    pub agents: Vec<AgentLiveness>,
}

/// Builds one agent. Intents naming a configured workflow are served by a
/// [`WorkflowHandler`] bound to this agent; the rest come from `catalog`.
fn build_agent(
    profile: &AgentProfile,
    catalog: &HandlerCatalog,
    broker: SharedBroker,
    config: &MeshConfig,
) -> Result<BaseAgent> {
    if !profile.intents.iter().any(|i| config.workflow(i).is_some()) {
        return BaseAgent::from_profile(profile, catalog, broker, config);
    }

    let agent = BaseAgent::builder(&profile.id, broker)
        .config(config.agent.for_profile(profile))
        .retry(RetryPolicy::from_config(&config.retry))
        .dedup(DedupCache::from_config(&config.dedup))
        .build()?;
    for intent in &profile.intents {
        if let Some(spec) = config.workflow(intent) {
            let handler = WorkflowHandler::new(Manager::for_agent(&agent), spec.clone());
            agent.register(intent, Arc::new(handler))?;
        } else if let Some(handler) = catalog.get(intent) {
            agent.register(intent, handler)?;
        } else {
            return Err(MeshError::Config(format!(
                "agent '{}': no handler for intent '{}'",
                profile.id, intent
            )));
        }
    }
    Ok(agent)
}

async fn stop_all(agents: &[BaseAgent]) {
    for agent in agents {
        if agent.is_running()
            && let Err(e) = agent.stop().await
        {
            warn!(agent = %agent.id(), error = %e, "Failed to stop agent");
        }
    }
}

/// Starts every configured agent, stops `stop_agents`, then sends `query` to
/// the agent serving the research workflow.
pub async fn run_demo(config: &MeshConfig, query: &str, stop_agents: &[String]) -> Result<DemoReport> {
    config.validate()?;
    let broker = broker::connect(&config.broker).await?;
    let catalog = demo_catalog();

    let manager_id = config
        .agents
        .iter()
        .find(|p| p.intents.iter().any(|i| i == RESEARCH_WORKFLOW))
        .map(|p| p.id.clone())
        .ok_or_else(|| {
            MeshError::Config(format!("no agent serves the '{}' intent", RESEARCH_WORKFLOW))
        })?;

    let client = BaseAgent::builder(DEMO_CLIENT, Arc::clone(&broker))
        .config(config.agent.clone())
        .retry(RetryPolicy::from_config(&config.retry))
        .build()?;
    let monitor = Arc::new(LivenessMonitor::from_config(&config.liveness));
    let heartbeats = monitor.attach(client.client()).await?;

    let mut agents = Vec::with_capacity(config.agents.len() + 1);
    let outcome = async {
        for profile in &config.agents {
            let agent = build_agent(profile, &catalog, Arc::clone(&broker), config)?;
            agent.start().await?;
            agents.push(agent);
        }
        client.start().await?;
        agents.push(client.clone());

        for id in stop_agents {
            match agents.iter().find(|a| a.id() == id) {
                Some(agent) => {
                    info!(agent = %id, "Stopping agent before the request");
                    agent.stop().await?;
                }
                None => warn!(agent = %id, "Unknown agent, nothing to stop"),
            }
        }

        client
            .request(&manager_id, RESEARCH_WORKFLOW, json!({ "query": query }))
            .await
    }
    .await;

    stop_all(&agents).await;
    if let Err(e) = client.client().unsubscribe(&heartbeats).await {
        warn!(error = %e, "Failed to detach liveness monitor");
    }
    let result = outcome?;

    let summary = if result.is_completed() {
        Some(result.output.clone())
    } else {
        result.error.as_ref().and_then(|e| e.detail.clone())
    };
    let outcome = summary.and_then(|value| serde_json::from_value(value).ok());

    Ok(DemoReport {
        result,
        outcome,
        agents: monitor.snapshot(),
    })
}
