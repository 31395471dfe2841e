use console::{Style, style};

use crate::agent::{AgentLiveness, Liveness};
use crate::orchestration::{NodeStatus, WorkflowOutcome, WorkflowStatus};

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_workflow(&self, outcome: &WorkflowOutcome) {
        println!(
            "{}  {}  {}",
            style(&outcome.workflow).bold(),
            self.workflow_style(outcome.status)
                .apply_to(outcome.status.to_string()),
            style(format!("{}ms", outcome.elapsed_ms)).dim()
        );
        println!();

        for node in &outcome.nodes {
            let marker = if node.degraded { " (degraded)" } else { "" };
            println!(
                "  {:<12} {:<11} {} → {}{}",
                node.id,
                self.node_style(node.status).apply_to(node.status.to_string()),
                style(&node.intent).dim(),
                node.target,
                style(marker).yellow()
            );
            if let Some(error) = &node.error {
                println!("  {:<12} {}", "", style(error.to_string()).red());
            }
        }

        if let Some(summary) = outcome.output.get("summary").and_then(|v| v.as_str()) {
            println!();
            println!("  {}", summary);
        }
    }

    pub fn print_liveness(&self, agents: &[AgentLiveness]) {
        for agent in agents {
            let liveness = match agent.liveness {
                Liveness::Alive => style(agent.liveness.to_string()).green(),
                Liveness::Stale => style(agent.liveness.to_string()).red(),
                Liveness::Unknown => style(agent.liveness.to_string()).dim(),
            };
            println!("  {:<16} {:<8} {}", agent.agent_id, liveness, agent.status);
        }
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }

    fn workflow_style(&self, status: WorkflowStatus) -> Style {
        match status {
            WorkflowStatus::Completed => Style::new().green(),
            WorkflowStatus::Degraded => Style::new().yellow().bold(),
            WorkflowStatus::Failed => Style::new().red().bold(),
        }
    }

    fn node_style(&self, status: NodeStatus) -> Style {
        match status {
            NodeStatus::Completed => Style::new().green(),
            NodeStatus::Failed => Style::new().red(),
            NodeStatus::TimedOut => Style::new().yellow(),
            NodeStatus::Skipped => Style::new().dim().strikethrough(),
            NodeStatus::Cancelled => Style::new().dim(),
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
