// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Node startup — assembles all subsystems and serves until shutdown.
//!
//! # Startup sequence
//!
//! [`run`] performs these steps in order:
//!
//! 1. Build the [`AgentCard`] from config (name, skills, capabilities).
//! 2. Construct the [`HubService`] (registry, task engine, router, timers)
//!    with the built-in stub handler, and spawn its loop.
//! 3. Load the bearer token file when auth is configured.
//! 4. Dial the configured peer hubs.
//! 5. Bind the listener (port-in-use is a fatal init error) and serve the
//!    Axum router until ctrl-c or `POST /shutdown`.
//!
//! ```text
//! HTTP client ──POST /──► router ──HubCommand──► HubService
//! peer agent ──GET /ws──► ws bridge ──────────►     │
//! peer hub   ◄──dialer──── dial::dial_peer ◄────────┘ outbound queues
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use agora_config::HubConfig;
use agora_hub::{HubService, StubHandler};
use agora_proto::{builtin_skills, AgentCard, CardCapabilities, Provider};

use crate::auth::BearerAuth;
use crate::error::NodeError;
use crate::http::{router, AppState};

/// Build the discovery card from config — a pure projection, independent of
/// any runtime state.
pub fn build_agent_card(config: &HubConfig) -> AgentCard {
    AgentCard {
        name: config.agent.name.clone(),
        description: config.agent.description.clone(),
        version: config
            .agent
            .version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        provider: Provider {
            organization: config.agent.provider.clone(),
            url: None,
        },
        url: format!("http://{}:{}/", config.network.host, config.network.port),
        capabilities: CardCapabilities {
            streaming: true,
            push_notifications: false,
            state_transition_history: true,
        },
        skills: builtin_skills(),
        default_input_modes: vec!["text".to_string(), "data".to_string()],
        default_output_modes: vec!["text".to_string(), "data".to_string()],
    }
}

/// Start the hub node. Blocks until ctrl-c or an HTTP shutdown request.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let card = Arc::new(build_agent_card(&config));
    info!(name = %card.name, url = %card.url, "agent identity");

    // ── Hub service ───────────────────────────────────────────────────────────
    let (service, hub) = HubService::new(Arc::clone(&config), Arc::new(StubHandler));
    tokio::spawn(service.run());

    // ── Auth ──────────────────────────────────────────────────────────────────
    let auth = match &config.auth.token_file {
        Some(path) => {
            let guard = BearerAuth::load(path)
                .map_err(|e| NodeError::Config(format!("token file {}: {e:#}", path.display())))?;
            info!(token_file = %path.display(), "bearer auth enabled");
            Some(Arc::new(guard))
        }
        None => None,
    };

    // ── Peer dialer ───────────────────────────────────────────────────────────
    for url in &config.network.peers {
        tokio::spawn(crate::dial::dial_peer(
            url.clone(),
            hub.clone(),
            config.messaging.outbound_queue,
        ));
    }

    // ── HTTP server (blocks until shutdown) ───────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = AppState {
        config: Arc::clone(&config),
        hub: hub.clone(),
        card,
        auth,
        shutdown: shutdown_tx,
    };

    let addr = config.network.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            NodeError::PortInUse(addr.clone())
        } else {
            NodeError::Http(e)
        }
    })?;
    info!(%addr, "hub listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
                _ = shutdown_rx.changed() => info!("shutdown requested"),
            }
        })
        .await?;

    hub.shutdown().await;
    info!("hub stopped");
    Ok(())
}
