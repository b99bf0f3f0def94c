// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Local coordination hub for heterogeneous AI agents.
///
/// `agora start` exposes the JSON-RPC front door and the WebSocket peer
/// fabric on one port; external AI clients discover it via
/// `/.well-known/agent.json`.
#[derive(Parser)]
#[command(name = "agora", version, about, long_about = None)]
pub struct Cli {
    /// Path to an explicit config file (merged over the default layers).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (or set AGORA_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the hub in the foreground.
    Start {
        /// Listen port, overriding `network.port` from the config.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Ask a running hub to shut down cleanly.
    Stop {
        /// Hub base URL. Defaults to the configured host and port.
        #[arg(long)]
        url: Option<String>,
    },

    /// Print a running hub's health snapshot.
    Status {
        /// Hub base URL. Defaults to the configured host and port.
        #[arg(long)]
        url: Option<String>,

        /// Raw JSON output instead of the human-readable summary.
        #[arg(long)]
        json: bool,
    },

    /// Manage the bearer token used when `auth.tokenFile` is configured.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Print the effective merged configuration and exit.
    ShowConfig,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Generate a fresh token, store its hash, and print it once.
    Generate,
}
