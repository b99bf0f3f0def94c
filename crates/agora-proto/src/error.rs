// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Error kinds shared across the hub, plus the mapping to JSON-RPC codes.

use thiserror::Error;

use crate::jsonrpc::{self, JsonRpcError};

/// Structural problems with a wire object, detected before routing.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),

    #[error("inbound message claims the host identity as sender")]
    FromHost,

    #[error("payload does not match message type: {0}")]
    Payload(#[source] serde_json::Error),
}

/// The error vocabulary of the hub. Kinds, not types: each component wraps
/// these in its own error enum; this is the set a caller can observe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("invalid request")]
    InvalidRequest,
    #[error("method not found")]
    MethodNotFound,
    #[error("invalid params")]
    InvalidParams,
    #[error("internal error")]
    InternalError,
    #[error("task not found")]
    TaskNotFound,
    #[error("task cannot be canceled")]
    TaskNotCancelable,
    #[error("not implemented")]
    NotImplemented,
    #[error("transport unavailable")]
    TransportUnavailable,
    #[error("timed out")]
    Timeout,
    #[error("unauthorized")]
    Unauthorized,
    #[error("no suitable agents")]
    NoSuitableAgents,
    #[error("consensus not reached")]
    ConsensusNotReached,
    #[error("handler failure")]
    HandlerFailure,
}

impl ErrorKind {
    /// The JSON-RPC code surfaced to HTTP callers. Peer-layer kinds that
    /// never cross the front door map to the internal-error code.
    pub fn code(&self) -> i64 {
        match self {
            ErrorKind::InvalidRequest => jsonrpc::INVALID_REQUEST,
            ErrorKind::MethodNotFound => jsonrpc::METHOD_NOT_FOUND,
            ErrorKind::InvalidParams => jsonrpc::INVALID_PARAMS,
            ErrorKind::TaskNotFound => jsonrpc::TASK_NOT_FOUND,
            ErrorKind::TaskNotCancelable => jsonrpc::TASK_NOT_CANCELABLE,
            ErrorKind::NotImplemented => jsonrpc::PUSH_NOTIFICATIONS_UNSUPPORTED,
            ErrorKind::Unauthorized => jsonrpc::UNAUTHORIZED,
            ErrorKind::InternalError
            | ErrorKind::TransportUnavailable
            | ErrorKind::Timeout
            | ErrorKind::NoSuitableAgents
            | ErrorKind::ConsensusNotReached
            | ErrorKind::HandlerFailure => jsonrpc::INTERNAL_ERROR,
        }
    }

    pub fn rpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_match_the_a2a_table() {
        assert_eq!(ErrorKind::InvalidRequest.code(), -32600);
        assert_eq!(ErrorKind::MethodNotFound.code(), -32601);
        assert_eq!(ErrorKind::InvalidParams.code(), -32602);
        assert_eq!(ErrorKind::InternalError.code(), -32603);
        assert_eq!(ErrorKind::TaskNotFound.code(), -32001);
        assert_eq!(ErrorKind::TaskNotCancelable.code(), -32002);
    }

    #[test]
    fn peer_layer_kinds_surface_as_internal() {
        assert_eq!(ErrorKind::TransportUnavailable.code(), -32603);
        assert_eq!(ErrorKind::Timeout.code(), -32603);
    }
}
