use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "a2a-mesh")]
#[command(author, version, about = "Agent-to-agent messaging mesh", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Path to the mesh configuration file
    #[arg(long, global = true, env = "A2A_MESH_CONFIG", default_value = "a2a-mesh.toml")]
    pub config: PathBuf,
}

/// Output format for CLI results.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the message relay for the network transport
    Relay {
        /// Listen address (default: broker.relay_addr)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the research workflow against canned tool agents
    Demo {
        /// Query sent to the manager
        #[arg(long, default_value = "login failures after the 2.3 release")]
        query: String,

        /// Stop this agent before the request is sent (repeatable)
        #[arg(long = "stop-agent")]
        stop_agent: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_demo() {
        let cli = Cli::parse_from([
            "a2a-mesh",
            "demo",
            "--stop-agent",
            "search-agent",
            "--stop-agent",
            "doc-agent",
            "-o",
            "json",
        ]);
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Demo { stop_agent, .. } => {
                assert_eq!(stop_agent, vec!["search-agent", "doc-agent"]);
            }
            _ => panic!("expected demo"),
        }
    }
}
