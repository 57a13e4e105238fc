use anyhow::Result;
use clap::Parser;
use prompt_loom::{config::Config, server::PromptLoomServer};
use rmcp::{transport::stdio, ServiceExt};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "prompt-loom", about = "Programmable prompt-execution MCP server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Root directory holding the prompts/gates/methodologies trees
    #[arg(long)]
    resource_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_from(args.config.as_deref())?;
    if let Some(root) = args.resource_root {
        config.resources.prompts_dir = root.join("prompts");
        config.resources.gates_dir = root.join("gates");
        config.resources.methodologies_dir = root.join("methodologies");
        config.resources.sessions_dir = root.join("sessions");
    }

    // stdout carries the protocol; logs go to stderr
    if !config.runtime.mcp_no_log {
        tracing_subscriber::fmt()
            .with_env_filter(config.runtime.log_level.clone())
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    }

    info!("Starting prompt-loom MCP server");

    let server = PromptLoomServer::new(config).await.map_err(|e| {
        eprintln!("Failed to create server: {}", e);
        anyhow::anyhow!(e.to_string())
    })?;
    let shutdown = server.shutdown.clone();

    let service = server.serve(stdio()).await.map_err(|e| {
        eprintln!("Failed to start MCP service: {}", e);
        e
    })?;

    info!("prompt-loom ready - waiting for requests");
    service.waiting().await?;

    // Stop the sweeper and watcher tasks on the way out
    shutdown.cancel();
    Ok(())
}
