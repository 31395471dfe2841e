use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use a2a_mesh::cli::demo::run_demo;
use a2a_mesh::cli::{Cli, Commands, ConfigAction, Display, OutputFormat};
use a2a_mesh::config::MeshConfig;
use a2a_mesh::error::{MeshError, Result};
use a2a_mesh::orchestration::WorkflowStatus;
use a2a_mesh::RelayServer;

/// Context for command output handling.
struct OutputContext<'a> {
    display: &'a Display,
    format: OutputFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("a2a_mesh=debug")
    } else {
        EnvFilter::new("a2a_mesh=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();
    let out = OutputContext {
        display: &display,
        format: cli.output,
    };
    let config_path = cli.config;

    match cli.command {
        Commands::Relay { bind } => cmd_relay(&out, &config_path, bind).await,
        Commands::Demo { query, stop_agent } => {
            cmd_demo(&out, &config_path, &query, &stop_agent).await
        }
        Commands::Config { action } => cmd_config(&out, &config_path, action).await,
    }
}

async fn cmd_relay(out: &OutputContext<'_>, config_path: &Path, bind: Option<String>) -> Result<()> {
    let config = MeshConfig::load(config_path).await?;
    let addr = bind.unwrap_or_else(|| config.broker.relay_addr.clone());

    let server = RelayServer::bind(&addr, config.broker.retention).await?;
    let local = server.local_addr()?;
    if out.format == OutputFormat::Text {
        out.display
            .print_success(&format!("Relay listening on {}", local));
        out.display.print_info("Press Ctrl-C to stop");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx).await
}

async fn cmd_demo(
    out: &OutputContext<'_>,
    config_path: &Path,
    query: &str,
    stop_agents: &[String],
) -> Result<()> {
    let config = MeshConfig::load(config_path).await?;
    let report = run_demo(&config, query, stop_agents).await?;

    match out.format {
        OutputFormat::Text => {
            out.display.print_header(&format!("Research: {}", query));
            match &report.outcome {
                Some(outcome) => out.display.print_workflow(outcome),
                None => out.display.print_warning(&format!(
                    "No workflow outcome: {}",
                    report
                        .result
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| report.result.status.to_string())
                )),
            }
            if !report.agents.is_empty() {
                println!();
                println!("Agents:");
                out.display.print_liveness(&report.agents);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    match report.outcome.as_ref().map(|o| o.status) {
        Some(WorkflowStatus::Completed) | Some(WorkflowStatus::Degraded) => Ok(()),
        _ => Err(MeshError::Workflow(format!(
            "research request ended with status {}",
            report.result.status
        ))),
    }
}

async fn cmd_config(out: &OutputContext<'_>, config_path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = MeshConfig::load(config_path).await?;
            match out.format {
                OutputFormat::Text => {
                    let text = toml::to_string_pretty(&config)
                        .map_err(|e| MeshError::Config(e.to_string()))?;
                    println!("{}", text);
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
            }
        }
        ConfigAction::Validate => {
            if !config_path.exists() {
                return Err(MeshError::Config(format!(
                    "{} does not exist",
                    config_path.display()
                )));
            }
            MeshConfig::load(config_path).await?;
            if out.format == OutputFormat::Text {
                out.display
                    .print_success(&format!("{} is valid", config_path.display()));
            }
        }
        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                return Err(MeshError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                )));
            }
            MeshConfig::default().save(config_path).await?;
            if out.format == OutputFormat::Text {
                out.display
                    .print_success(&format!("Wrote {}", config_path.display()));
            }
        }
    }

    Ok(())
}
