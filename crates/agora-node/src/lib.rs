// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The transport layer of the agora hub: an Axum HTTP server carrying the
//! JSON-RPC front door (with SSE streaming), the discovery card, the health
//! endpoint and the WebSocket peer fabric — plus the outbound dialer that
//! connects to configured peer hubs.

pub mod auth;
pub mod dial;
pub mod error;
pub mod http;
pub mod node;
pub mod ws;

pub use error::NodeError;
pub use http::{router, AppState};
pub use node::{build_agent_card, run};
