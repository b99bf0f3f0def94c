// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use agora_proto::{ErrorKind, ProtoError, TaskState};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("task {0} is in a terminal state and cannot be canceled")]
    TaskNotCancelable(String),

    #[error("transition {from:?} -> {to:?} is not permitted")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("agent {identity} was not invited to task {task_id}")]
    NotInvited { task_id: String, identity: String },

    #[error("no connection for agent {0}")]
    TransportUnavailable(String),

    #[error("pending-reply table is full")]
    PendingFull,

    #[error("hub service has shut down")]
    ServiceClosed,

    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl HubError {
    /// The observable error kind, for JSON-RPC surfacing.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::TaskNotFound(_) => ErrorKind::TaskNotFound,
            HubError::TaskNotCancelable(_) => ErrorKind::TaskNotCancelable,
            HubError::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            HubError::Handler(_) => ErrorKind::HandlerFailure,
            HubError::Proto(_) => ErrorKind::InvalidRequest,
            HubError::NotInvited { .. } => ErrorKind::InvalidRequest,
            HubError::InvalidTransition { .. }
            | HubError::PendingFull
            | HubError::ServiceClosed => ErrorKind::InternalError,
        }
    }
}
