// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The peer coordination message — the unit of traffic on the WebSocket
//! fabric, distinct from the JSON-RPC envelope of the HTTP front door.
//!
//! Each WebSocket text frame carries exactly one [`PeerMessage`] as JSON.
//! The `type` field is an addressing verb from a closed vocabulary
//! ([`MessageType`]); unknown verbs still parse (the router surfaces them as
//! an `unknown` observability event) but never dispatch to a component.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtoError;

/// Reserved value for `PeerMessage::to` that fans out to every connection.
pub const BROADCAST: &str = "broadcast";

/// Milliseconds since the Unix epoch, the timestamp unit of every wire type.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ── Message envelope ──────────────────────────────────────────────────────────

/// A single coordination message on the peer fabric.
///
/// Every field is required; [`PeerMessage::validate`] enforces the structural
/// invariants before a message is routed anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub from: String,
    pub to: String,
    pub data: serde_json::Value,
    pub timestamp: u64,
}

impl PeerMessage {
    /// Build a message with a fresh id and the current timestamp.
    pub fn new(
        message_type: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.as_str().to_string(),
            from: from.into(),
            to: to.into(),
            data,
            timestamp: now_ms(),
        }
    }

    /// The closed-vocabulary verb, or `None` for an unknown `type`.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.message_type)
    }

    /// Collaboration (1) versus ecosystem (2), derived from the type prefix.
    pub fn layer(&self) -> u8 {
        let t = self.message_type.as_str();
        if t.starts_with("ecosystem:") || t.starts_with("plugin:") || t.starts_with("workflow:") {
            2
        } else {
            1
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }

    /// The id of the message this one replies to, when `data.replyTo` is set.
    pub fn reply_to(&self) -> Option<&str> {
        self.data.get("replyTo").and_then(|v| v.as_str())
    }

    /// Structural validation: every envelope field non-empty, and inbound
    /// traffic must not impersonate the host.
    pub fn validate(&self, host_identity: &str) -> Result<(), ProtoError> {
        if self.id.is_empty() {
            return Err(ProtoError::MissingField("id"));
        }
        if self.message_type.is_empty() {
            return Err(ProtoError::MissingField("type"));
        }
        if self.from.is_empty() {
            return Err(ProtoError::MissingField("from"));
        }
        if self.to.is_empty() {
            return Err(ProtoError::MissingField("to"));
        }
        if self.timestamp == 0 {
            return Err(ProtoError::MissingField("timestamp"));
        }
        if self.data.is_null() {
            return Err(ProtoError::MissingField("data"));
        }
        if self.from == host_identity {
            return Err(ProtoError::FromHost);
        }
        Ok(())
    }

    /// Decode the payload into a typed structure.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtoError> {
        serde_json::from_value(self.data.clone()).map_err(ProtoError::Payload)
    }
}

// ── Vocabulary ────────────────────────────────────────────────────────────────

/// The closed set of addressing verbs used on the WebSocket fabric and as the
/// internal routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    AgentRegister,
    AgentDiscovery,
    AgentDiscoveryResponse,
    TaskInvite,
    TaskContribution,
    TaskCompleted,
    CoordinationVote,
    CoordinationConsensus,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::AgentRegister => "agent:register",
            MessageType::AgentDiscovery => "agent:discovery",
            MessageType::AgentDiscoveryResponse => "agent:discovery:response",
            MessageType::TaskInvite => "task:invite",
            MessageType::TaskContribution => "task:contribution",
            MessageType::TaskCompleted => "task:completed",
            MessageType::CoordinationVote => "coordination:vote",
            MessageType::CoordinationConsensus => "coordination:consensus",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "agent:register" => MessageType::AgentRegister,
            "agent:discovery" => MessageType::AgentDiscovery,
            "agent:discovery:response" => MessageType::AgentDiscoveryResponse,
            "task:invite" => MessageType::TaskInvite,
            "task:contribution" => MessageType::TaskContribution,
            "task:completed" => MessageType::TaskCompleted,
            "coordination:vote" => MessageType::CoordinationVote,
            "coordination:consensus" => MessageType::CoordinationConsensus,
            _ => return None,
        })
    }
}

// ── Agent identity ────────────────────────────────────────────────────────────

/// What an agent is for, as declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Host,
    CodeAssistant,
    Specialist,
    Validator,
    Coordinator,
    Other,
}

/// Compact agent descriptor: the payload of `agent:register` and
/// `agent:discovery:response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: AgentKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Origin URL for outbound addressing, when the agent is dialable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: u64,
}

/// Payload of an inbound `agent:discovery` probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPayload {
    pub agent_id: String,
    pub timestamp: u64,
}

// ── Task coordination payloads ────────────────────────────────────────────────

/// How a task's work is dispatched to participants and its outputs merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    PeerToPeer,
    Hierarchical,
    Consensus,
}

impl Default for PatternKind {
    fn default() -> Self {
        PatternKind::PeerToPeer
    }
}

/// Payload of `task:invite` — host asks a peer to participate in a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub task_id: String,
    pub task_data: serde_json::Value,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub pattern: PatternKind,
    /// Set when the invitee is asked to coordinate (hierarchical pattern).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub coordinator: bool,
}

/// Payload of `task:contribution` — a participant submits its piece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionPayload {
    pub task_id: String,
    pub participation: serde_json::Value,
}

/// Payload of `task:completed` — the creator announces the terminal result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPayload {
    pub task_id: String,
    pub state: crate::a2a::TaskState,
    pub final_result: serde_json::Value,
}

/// Payload of `coordination:vote`. The proposal id is the task id of the
/// consensus task being voted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePayload {
    pub proposal_id: String,
    pub vote: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(from: &str) -> PeerMessage {
        PeerMessage::new(
            MessageType::AgentDiscovery,
            from,
            "host-1",
            json!({"agentId": from, "timestamp": 1}),
        )
    }

    #[test]
    fn message_json_uses_wire_field_names() {
        let v = serde_json::to_value(sample("peer-a")).unwrap();
        assert!(v.get("type").is_some(), "verb must serialize as `type`");
        assert!(v.get("timestamp").is_some());
        assert_eq!(v["from"], "peer-a");
    }

    #[test]
    fn json_round_trip() {
        let msg = sample("peer-a");
        let text = serde_json::to_string(&msg).unwrap();
        let back: PeerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn vocabulary_round_trips_through_strings() {
        for t in [
            MessageType::AgentRegister,
            MessageType::AgentDiscovery,
            MessageType::AgentDiscoveryResponse,
            MessageType::TaskInvite,
            MessageType::TaskContribution,
            MessageType::TaskCompleted,
            MessageType::CoordinationVote,
            MessageType::CoordinationConsensus,
        ] {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("agent:unknown"), None);
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let mut msg = sample("peer-a");
        msg.from = String::new();
        assert!(matches!(
            msg.validate("host-1"),
            Err(ProtoError::MissingField("from"))
        ));

        let mut msg = sample("peer-a");
        msg.data = serde_json::Value::Null;
        assert!(matches!(
            msg.validate("host-1"),
            Err(ProtoError::MissingField("data"))
        ));
    }

    #[test]
    fn validate_rejects_host_impersonation() {
        let msg = sample("host-1");
        assert!(matches!(msg.validate("host-1"), Err(ProtoError::FromHost)));
        assert!(sample("peer-a").validate("host-1").is_ok());
    }

    #[test]
    fn layer_derives_from_type_prefix() {
        let mut msg = sample("peer-a");
        assert_eq!(msg.layer(), 1);
        msg.message_type = "ecosystem:proposal".to_string();
        assert_eq!(msg.layer(), 2);
        msg.message_type = "plugin:contribution".to_string();
        assert_eq!(msg.layer(), 2);
    }

    #[test]
    fn reply_to_reads_data_field() {
        let mut msg = sample("peer-a");
        assert_eq!(msg.reply_to(), None);
        msg.data = json!({"replyTo": "msg-42"});
        assert_eq!(msg.reply_to(), Some("msg-42"));
    }

    #[test]
    fn invite_payload_wire_shape() {
        let invite = InvitePayload {
            task_id: "t1".to_string(),
            task_data: json!({"description": "review"}),
            capabilities: vec!["code-analysis".to_string()],
            pattern: PatternKind::Hierarchical,
            coordinator: true,
        };
        let v = serde_json::to_value(&invite).unwrap();
        assert_eq!(v["taskId"], "t1");
        assert_eq!(v["pattern"], "hierarchical");
        assert_eq!(v["coordinator"], true);
    }
}
