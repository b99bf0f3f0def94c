// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use agora_config::HubConfig;
use cli::{Cli, Commands, TokenCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = agora_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start { port } => {
            if let Some(port) = port {
                config.network.port = port;
            }
            agora_node::run(config).await
        }
        Commands::Stop { url } => stop(&config, url).await,
        Commands::Status { url, json } => status(&config, url, json).await,
        Commands::Token { command } => match command {
            TokenCommands::Generate => token_generate(&config),
        },
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("AGORA_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn base_url(config: &HubConfig, url: Option<String>) -> String {
    url.unwrap_or_else(|| format!("http://{}:{}", config.network.host, config.network.port))
}

/// Bearer token for `stop` against an auth-enabled hub.
fn client_token() -> Option<String> {
    std::env::var("AGORA_TOKEN").ok()
}

async fn stop(config: &HubConfig, url: Option<String>) -> anyhow::Result<()> {
    let base = base_url(config, url);
    let client = reqwest::Client::new();
    let mut request = client.post(format!("{base}/shutdown"));
    if let Some(token) = client_token() {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("no hub reachable at {base}"))?;
    anyhow::ensure!(
        response.status().is_success(),
        "hub refused shutdown: {}",
        response.status()
    );
    println!("hub at {base} is shutting down");
    Ok(())
}

async fn status(config: &HubConfig, url: Option<String>, json: bool) -> anyhow::Result<()> {
    let base = base_url(config, url);
    let response = reqwest::get(format!("{base}/health"))
        .await
        .with_context(|| format!("no hub reachable at {base}"))?;
    anyhow::ensure!(
        response.status().is_success(),
        "health check failed: {}",
        response.status()
    );

    let health: serde_json::Value = response.json().await.context("invalid health body")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    println!("hub:       {base}");
    println!("identity:  {}", health["identity"].as_str().unwrap_or("-"));
    println!("uptime:    {}s", health["uptime"]);
    println!("agents:    {}", health["activeAgents"]);
    println!("tasks:     {}", health["activeTasks"]);
    println!(
        "counters:  {} messages, {} tasks completed, {} errors, {} dropped",
        health["messagesProcessed"],
        health["tasksCompleted"],
        health["errors"],
        health["droppedMessages"],
    );
    Ok(())
}

fn token_generate(config: &HubConfig) -> anyhow::Result<()> {
    let path = config
        .auth
        .token_file
        .clone()
        .unwrap_or_else(default_token_path);
    let token = agora_node::auth::provision(&path)?;
    println!("New bearer token (save it now — it won't be shown again):");
    println!("  {token}");
    println!();
    println!("Stored hash: {}", path.display());
    println!("Enable auth by setting in your config:");
    println!("  auth:");
    println!("    tokenFile: \"{}\"", path.display());
    Ok(())
}

fn default_token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/agora/token.yaml")
}
