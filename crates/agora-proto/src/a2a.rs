// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Front-door objects: the messages and task snapshots exchanged with
//! external clients over JSON-RPC, following the agent-to-agent protocol's
//! naming (`camelCase` members, kebab-case task states).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Task lifecycle ────────────────────────────────────────────────────────────

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Submitted and awaiting coordination or handler pickup.
    Submitted,
    /// Actively being worked on.
    Working,
    /// Paused, waiting for external input.
    InputRequired,
    Completed,
    Canceled,
    Failed,
    /// Rejected before any work started.
    Rejected,
    /// Waiting for credentials (reserved).
    AuthRequired,
    Unknown,
    /// Timed out in a non-terminal state.
    Expired,
}

impl TaskState {
    /// Terminal states carry a result and accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::Canceled
                | TaskState::Failed
                | TaskState::Rejected
                | TaskState::Expired
        )
    }
}

/// One entry of a task's append-only status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub state: TaskState,
    pub timestamp: u64,
}

/// One participant's contribution to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub identity: String,
    pub contribution: serde_json::Value,
    pub submitted_at: u64,
}

/// Read-only task snapshot returned by `tasks/get` and `tasks/cancel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: String,
    pub context_id: String,
    pub state: TaskState,
    pub required_capabilities: Vec<String>,
    pub requester: String,
    pub participants: Vec<Participant>,
    pub status_history: Vec<StatusEntry>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    /// Final aggregated artifact; set iff `state` is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One ordered piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    Data { data: serde_json::Value },
    Uri { uri: String },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text { text: s.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

fn default_message_kind() -> String {
    "message".to_string()
}

/// A user or agent message crossing the front door.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    #[serde(default = "default_message_kind")]
    pub kind: String,
    pub message_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AgentMessage {
    /// A fresh agent-role reply.
    pub fn agent(parts: Vec<Part>, metadata: Option<serde_json::Value>) -> Self {
        Self {
            kind: default_message_kind(),
            message_id: Uuid::new_v4().to_string(),
            role: Role::Agent,
            parts,
            context_id: None,
            task_id: None,
            metadata,
        }
    }

    /// All text parts joined with newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parameters of `message/send` and `message/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSendParams {
    pub message: AgentMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result member of a successful `message/send` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub task_id: String,
    pub message: AgentMessage,
}

// ── Unit tests ────────────────────────────────────────────────────────────────
