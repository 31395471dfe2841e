//! Fan-out/fan-in execution of a [`WorkflowSpec`] over agent requests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::workflow::{FailurePolicy, NodeSpec, WorkflowSpec};
use crate::agent::{BaseAgent, HandlerError, IntentHandler, Requester};
use crate::error::Result;
use crate::messaging::{TRANSPORT, TaskError, TaskRequest, TaskResult, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
    TimedOut,
    /// Never dispatched because the workflow was aborted.
    Skipped,
    /// Dispatched, then abandoned when the workflow was aborted; the target
    /// may still have run it.
    Cancelled,
}

impl NodeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    /// Finished with at least one failed node absorbed by `proceed_degraded`.
    Degraded,
    Failed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub id: String,
    pub target: String,
    pub intent: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Ran with at least one failed predecessor.
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl NodeOutcome {
    fn from_result(node: &NodeSpec, result: TaskResult, degraded: bool, elapsed: Duration) -> Self {
        let status = match result.status {
            TaskStatus::Completed => NodeStatus::Completed,
            TaskStatus::Failed => NodeStatus::Failed,
            TaskStatus::Timeout => NodeStatus::TimedOut,
        };
        Self {
            id: node.id.clone(),
            target: node.target.clone(),
            intent: node.intent.clone(),
            status,
            output: result.output,
            error: result.error,
            degraded,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    fn unfinished(node: &NodeSpec, status: NodeStatus) -> Self {
        Self {
            id: node.id.clone(),
            target: node.target.clone(),
            intent: node.intent.clone(),
            status,
            output: Value::Null,
            error: None,
            degraded: false,
            elapsed_ms: 0,
        }
    }

    fn as_predecessor(&self) -> Value {
        json!({
            "status": self.status,
            "output": self.output,
            "error": self.error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow: String,
    pub status: WorkflowStatus,
    /// In declaration order.
    pub nodes: Vec<NodeOutcome>,
    /// Sink output; an object keyed by node id when there are several sinks.
    pub output: Value,
    pub elapsed_ms: u64,
}

impl WorkflowOutcome {
    pub fn node(&self, id: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_degraded(&self) -> bool {
        self.status == WorkflowStatus::Degraded
    }
}

/// Runs workflows on behalf of one agent, using its pending-request table.
#[derive(Clone)]
pub struct Manager {
    requester: Requester,
    default_timeout: Duration,
}

impl Manager {
    pub fn new(requester: Requester, default_timeout: Duration) -> Self {
        Self {
            requester,
            default_timeout,
        }
    }

    pub fn for_agent(agent: &BaseAgent) -> Self {
        Self::new(agent.requester(), agent.config().default_request_timeout())
    }

    /// Executes `spec`: roots are dispatched concurrently and every other node
    /// is dispatched once all of its predecessors are terminal.
    pub async fn run(&self, spec: &WorkflowSpec, input: Value) -> Result<WorkflowOutcome> {
        spec.validate()?;
        let started = Instant::now();
        info!(
            workflow = %spec.name,
            manager = %self.requester.agent_id(),
            nodes = spec.nodes.len(),
            "Workflow started"
        );

        let mut outcomes: HashMap<String, NodeOutcome> = HashMap::new();
        let mut dispatched: HashSet<&str> = HashSet::new();
        let mut running = FuturesUnordered::new();
        let mut aborted = false;

        loop {
            if !aborted {
                for node in &spec.nodes {
                    if dispatched.contains(node.id.as_str())
                        || !node.depends_on.iter().all(|d| outcomes.contains_key(d))
                    {
                        continue;
                    }
                    dispatched.insert(node.id.as_str());

                    let (payload, degraded) = join_payload(node, &outcomes, &input);
                    let timeout = node
                        .timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(self.default_timeout);
                    debug!(
                        workflow = %spec.name,
                        node = %node.id,
                        to = %node.target,
                        intent = %node.intent,
                        degraded,
                        "Dispatching node"
                    );

                    let requester = self.requester.clone();
                    running.push(async move {
                        let sent = Instant::now();
                        let result = requester
                            .send_request_and_wait(&node.target, &node.intent, payload, timeout)
                            .await;
                        (node, result, degraded, sent.elapsed())
                    });
                }
            }

            if aborted {
                break;
            }
            let Some((node, result, degraded, elapsed)) = running.next().await else {
                break;
            };

            let result = result.unwrap_or_else(|e| {
                TaskResult::failed(&node.id, TaskError::new(TRANSPORT, e.to_string()))
            });
            let outcome = NodeOutcome::from_result(node, result, degraded, elapsed);

            if !outcome.status.is_success() {
                let policy = spec.effective_policy(node);
                warn!(
                    workflow = %spec.name,
                    node = %node.id,
                    status = %outcome.status,
                    error = ?outcome.error.as_ref().map(|e| e.to_string()),
                    %policy,
                    "Node did not complete"
                );
                if policy == FailurePolicy::FailWorkflow {
                    aborted = true;
                }
            } else {
                debug!(workflow = %spec.name, node = %node.id, elapsed_ms = outcome.elapsed_ms, "Node completed");
            }
            outcomes.insert(node.id.clone(), outcome);
        }
        // Dropping in-flight waits evicts their pending entries.
        drop(running);

        let nodes: Vec<NodeOutcome> = spec
            .nodes
            .iter()
            .map(|node| {
                outcomes.remove(&node.id).unwrap_or_else(|| {
                    let status = if dispatched.contains(node.id.as_str()) {
                        NodeStatus::Cancelled
                    } else {
                        NodeStatus::Skipped
                    };
                    NodeOutcome::unfinished(node, status)
                })
            })
            .collect();

        let sinks = spec.sinks();
        let all_sinks_failed = sinks.iter().all(|sink| {
            nodes
                .iter()
                .find(|n| n.id == sink.id)
                .is_none_or(|n| !n.status.is_success())
        });
        let status = if aborted || all_sinks_failed {
            WorkflowStatus::Failed
        } else if nodes.iter().any(|n| !n.status.is_success() || n.degraded) {
            WorkflowStatus::Degraded
        } else {
            WorkflowStatus::Completed
        };

        let output = if sinks.len() == 1 {
            nodes
                .iter()
                .find(|n| n.id == sinks[0].id)
                .map(|n| n.output.clone())
                .unwrap_or(Value::Null)
        } else {
            let mut map = Map::new();
            for sink in &sinks {
                if let Some(n) = nodes.iter().find(|n| n.id == sink.id) {
                    map.insert(n.id.clone(), n.output.clone());
                }
            }
            Value::Object(map)
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(workflow = %spec.name, %status, elapsed_ms, "Workflow finished");
        Ok(WorkflowOutcome {
            workflow: spec.name.clone(),
            status,
            nodes,
            output,
            elapsed_ms,
        })
    }
}

/// Builds the request payload for `node` from its predecessors' outcomes.
fn join_payload(
    node: &NodeSpec,
    outcomes: &HashMap<String, NodeOutcome>,
    input: &Value,
) -> (Value, bool) {
    let mut predecessors = Map::new();
    let mut missing = Vec::new();
    for dep in &node.depends_on {
        if let Some(outcome) = outcomes.get(dep) {
            if !outcome.status.is_success() {
                missing.push(dep.clone());
            }
            predecessors.insert(dep.clone(), outcome.as_predecessor());
        }
    }
    let degraded = !missing.is_empty();
    let payload = json!({
        "input": input,
        "params": node.params,
        "predecessors": predecessors,
        "missing": missing,
        "degraded": degraded,
    });
    (payload, degraded)
}

/// Exposes a workflow as an intent on the manager agent.
pub struct WorkflowHandler {
    manager: Manager,
    spec: WorkflowSpec,
}

impl WorkflowHandler {
    pub fn new(manager: Manager, spec: WorkflowSpec) -> Self {
        Self { manager, spec }
    }
}

#[async_trait]
impl IntentHandler for WorkflowHandler {
    async fn handle(&self, request: &TaskRequest) -> std::result::Result<Value, HandlerError> {
        let outcome = self
            .manager
            .run(&self.spec, request.payload.clone())
            .await
            .map_err(|e| HandlerError::new("workflow_error", e.to_string()))?;

        let summary = serde_json::to_value(&outcome)
            .map_err(|e| HandlerError::new("workflow_error", e.to_string()))?;
        if outcome.status == WorkflowStatus::Failed {
            return Err(HandlerError::new(
                "workflow_failed",
                format!("workflow '{}' failed", outcome.workflow),
            )
            .with_detail(summary));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, status: NodeStatus, output: Value) -> NodeOutcome {
        NodeOutcome {
            id: id.into(),
            target: "x".into(),
            intent: "run".into(),
            status,
            output,
            error: None,
            degraded: false,
            elapsed_ms: 1,
        }
    }

    #[test]
    fn test_join_payload_marks_missing_inputs() {
        let node = NodeSpec::new("join", "synthesis-agent", "synthesize")
            .depends_on(&["a", "b"])
            .params(json!({"style": "brief"}));
        let mut outcomes = HashMap::new();
        outcomes.insert("a".to_string(), outcome("a", NodeStatus::Completed, json!(["t1"])));
        outcomes.insert("b".to_string(), outcome("b", NodeStatus::TimedOut, Value::Null));

        let (payload, degraded) = join_payload(&node, &outcomes, &json!({"query": "q"}));
        assert!(degraded);
        assert_eq!(payload["input"]["query"], "q");
        assert_eq!(payload["params"]["style"], "brief");
        assert_eq!(payload["predecessors"]["a"]["output"], json!(["t1"]));
        assert_eq!(payload["predecessors"]["b"]["status"], "timed_out");
        assert_eq!(payload["missing"], json!(["b"]));
    }

    #[test]
    fn test_root_payload() {
        let node = NodeSpec::new("root", "search-agent", "web_search");
        let (payload, degraded) = join_payload(&node, &HashMap::new(), &json!({"query": "q"}));
        assert!(!degraded);
        assert_eq!(payload["predecessors"], json!({}));
        assert_eq!(payload["missing"], json!([]));
    }
}
