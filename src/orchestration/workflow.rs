//! Declared workflow graphs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, Result};

/// What happens to the rest of the workflow when a node fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching; nodes not yet started are skipped.
    #[default]
    FailWorkflow,
    /// Dependents run with the surviving inputs and are flagged degraded.
    ProceedDegraded,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FailWorkflow => "fail_workflow",
            Self::ProceedDegraded => "proceed_degraded",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    /// Agent that receives this node's request.
    pub target: String,
    pub intent: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Static parameters merged into the request payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the workflow's default policy for this node's failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<FailurePolicy>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, target: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            intent: intent.into(),
            depends_on: Vec::new(),
            params: Value::Null,
            timeout_ms: None,
            policy: None,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn is_join(&self) -> bool {
        self.depends_on.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub default_policy: FailurePolicy,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_policy: FailurePolicy::default(),
            nodes: Vec::new(),
        }
    }

    pub fn default_policy(mut self, policy: FailurePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn get(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn effective_policy(&self, node: &NodeSpec) -> FailurePolicy {
        node.policy.unwrap_or(self.default_policy)
    }

    pub fn roots(&self) -> Vec<&NodeSpec> {
        self.nodes.iter().filter(|n| n.depends_on.is_empty()).collect()
    }

    /// Nodes nothing depends on; their outputs form the workflow output.
    pub fn sinks(&self) -> Vec<&NodeSpec> {
        let referenced: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.depends_on.iter().map(String::as_str))
            .collect();
        self.nodes
            .iter()
            .filter(|n| !referenced.contains(n.id.as_str()))
            .collect()
    }

    /// Kahn's algorithm, ties broken by declaration order.
    /// Returns `None` when the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<&str>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| n.depends_on.is_empty())
            .map(|n| n.id.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &next in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.nodes.is_empty() {
            errors.push("at least one node is required".to_string());
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                errors.push("node id must not be empty".to_string());
            } else if !ids.insert(node.id.as_str()) {
                errors.push(format!("duplicate node id '{}'", node.id));
            }
            if node.target.trim().is_empty() {
                errors.push(format!("node '{}': target must not be empty", node.id));
            }
            if node.intent.trim().is_empty() || node.intent.chars().any(char::is_whitespace) {
                errors.push(format!("node '{}': invalid intent {:?}", node.id, node.intent));
            }
            if node.timeout_ms == Some(0) {
                errors.push(format!("node '{}': timeout_ms must be greater than 0", node.id));
            }
        }

        let mut unknown = false;
        for node in &self.nodes {
            for dep in &node.depends_on {
                if dep == &node.id {
                    errors.push(format!("node '{}' depends on itself", node.id));
                    unknown = true;
                } else if !ids.contains(dep.as_str()) {
                    errors.push(format!("node '{}' depends on unknown node '{}'", node.id, dep));
                    unknown = true;
                }
            }
        }

        if !unknown && errors.is_empty() && self.topological_order().is_none() {
            errors.push("dependency graph contains a cycle".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Workflow(format!(
                "workflow '{}': {}",
                self.name,
                errors.join("; ")
            )))
        }
    }
}
