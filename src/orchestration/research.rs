//! The research workflow: ticket lookup, document retrieval and web search
//! fan out in parallel, then synthesis joins their outputs.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::workflow::{FailurePolicy, NodeSpec, WorkflowSpec};
use crate::agent::{HandlerError, IntentHandler};
use crate::config::AgentProfile;
use crate::messaging::TaskRequest;

pub const RESEARCH_WORKFLOW: &str = "research";
pub const MANAGER_AGENT: &str = "manager";
pub const TICKET_AGENT: &str = "ticket-agent";
pub const DOC_AGENT: &str = "doc-agent";
pub const SEARCH_AGENT: &str = "search-agent";
pub const SYNTHESIS_AGENT: &str = "synthesis-agent";

pub const LOOKUP_TICKETS: &str = "lookup_tickets";
pub const RETRIEVE_DOCUMENTS: &str = "retrieve_documents";
pub const WEB_SEARCH: &str = "web_search";
pub const SYNTHESIZE: &str = "synthesize";

pub fn research_workflow() -> WorkflowSpec {
    WorkflowSpec::new(RESEARCH_WORKFLOW)
        .default_policy(FailurePolicy::ProceedDegraded)
        .node(NodeSpec::new("tickets", TICKET_AGENT, LOOKUP_TICKETS).timeout_ms(1000))
        .node(NodeSpec::new("documents", DOC_AGENT, RETRIEVE_DOCUMENTS).timeout_ms(1000))
        .node(NodeSpec::new("search", SEARCH_AGENT, WEB_SEARCH).timeout_ms(1000))
        .node(
            NodeSpec::new("synthesis", SYNTHESIS_AGENT, SYNTHESIZE)
                .depends_on(&["tickets", "documents", "search"])
                .timeout_ms(2000)
                // Without a synthesis there is nothing to return.
                .policy(FailurePolicy::FailWorkflow),
        )
}

pub fn default_profiles() -> Vec<AgentProfile> {
    vec![
        AgentProfile::new(MANAGER_AGENT, &[RESEARCH_WORKFLOW]),
        AgentProfile::new(TICKET_AGENT, &[LOOKUP_TICKETS]),
        AgentProfile::new(DOC_AGENT, &[RETRIEVE_DOCUMENTS]),
        AgentProfile::new(SEARCH_AGENT, &[WEB_SEARCH]),
        AgentProfile::new(SYNTHESIS_AGENT, &[SYNTHESIZE]),
    ]
}

/// Join handler: merges every completed predecessor's findings into one
/// report and carries the degraded flag through.
pub struct SynthesisHandler;

#[async_trait]
impl IntentHandler for SynthesisHandler {
    async fn handle(&self, request: &TaskRequest) -> Result<Value, HandlerError> {
        let payload = &request.payload;
        let Some(predecessors) = payload.get("predecessors").and_then(Value::as_object) else {
            return Err(HandlerError::invalid_payload(
                "synthesize expects a join payload with predecessors",
            ));
        };

        let mut sources = Vec::new();
        let mut findings = serde_json::Map::new();
        for (id, outcome) in predecessors {
            if outcome.get("status").and_then(Value::as_str) == Some("completed") {
                sources.push(id.clone());
                findings.insert(id.clone(), outcome.get("output").cloned().unwrap_or(Value::Null));
            }
        }
        if sources.is_empty() {
            return Err(HandlerError::new(
                "no_inputs",
                "every predecessor failed, nothing to synthesize",
            ));
        }
        sources.sort();

        let query = payload
            .pointer("/input/query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let missing = payload.get("missing").cloned().unwrap_or_else(|| json!([]));
        let degraded = payload
            .get("degraded")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(json!({
            "query": query,
            "summary": format!(
                "Findings for '{}' from {} source(s): {}",
                query,
                sources.len(),
                sources.join(", ")
            ),
            "sources": sources,
            "findings": findings,
            "missing": missing,
            "degraded": degraded,
        }))
    }
}
