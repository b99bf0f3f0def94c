// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Fatal startup failures of the transport layer.  These abort `run` and
/// drive the CLI's non-zero exit code.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("address {0} is already in use")]
    PortInUse(String),

    #[error("HTTP server error: {0}")]
    Http(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
