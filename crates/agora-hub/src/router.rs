// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The message router: validates inbound coordination messages, records
//! them in the diagnostic history ring, resolves request/response
//! correlation, and classifies each message for the service loop.
//!
//! Delivery is best-effort — a unicast to a disconnected agent fails with
//! `TransportUnavailable` and is never retried here.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use agora_proto::{
    AgentDescriptor, CompletedPayload, ContributionPayload, DiscoveryPayload, InvitePayload,
    MessageType, PeerMessage, VotePayload,
};

use crate::conn::{ConnectionHandle, ConnectionId, ConnectionTable, PushOutcome};
use crate::error::HubError;
use crate::history::MessageHistory;

/// Bound of the pending-reply table; entries past this are refused rather
/// than queued without limit.
const PENDING_REPLY_CAPACITY: usize = 256;

/// A validated inbound message, classified for dispatch.
#[derive(Debug)]
pub enum Routed {
    Register {
        descriptor: AgentDescriptor,
        via: Option<ConnectionId>,
    },
    Discovery {
        from: String,
        /// Envelope id of the probe, echoed as `replyTo` in the response.
        request_id: String,
        probe: DiscoveryPayload,
        via: Option<ConnectionId>,
    },
    /// A peer's descriptor observed on the fabric (periodic broadcast).
    DiscoveryResponse {
        descriptor: AgentDescriptor,
        via: Option<ConnectionId>,
    },
    Invite {
        from: String,
        invite: InvitePayload,
    },
    Contribution {
        from: String,
        contribution: ContributionPayload,
    },
    Completed {
        from: String,
        completed: CompletedPayload,
    },
    Vote {
        from: String,
        vote: VotePayload,
    },
    ConsensusNotice {
        from: String,
        data: serde_json::Value,
    },
    /// The message answered a pending request and was consumed by the waiter.
    Reply,
    /// A verb outside the closed vocabulary; surfaced for observability only.
    Unknown { message_type: String },
}

struct PendingEntry {
    tx: oneshot::Sender<PeerMessage>,
    deadline: Instant,
}

pub struct Router {
    host_identity: String,
    validate_schema: bool,
    history: MessageHistory,
    conns: ConnectionTable,
    pending: HashMap<String, PendingEntry>,
}

impl Router {
    pub fn new(host_identity: impl Into<String>, validate_schema: bool, history: usize) -> Self {
        Self {
            host_identity: host_identity.into(),
            validate_schema,
            history: MessageHistory::new(history),
            conns: ConnectionTable::default(),
            pending: HashMap::new(),
        }
    }

    // ── Ingress ───────────────────────────────────────────────────────────────

    /// Validate, record and classify one inbound message.
    pub fn ingest(
        &mut self,
        msg: PeerMessage,
        via: Option<ConnectionId>,
    ) -> Result<Routed, HubError> {
        if self.validate_schema {
            msg.validate(&self.host_identity)?;
        }
        self.history.push(msg.clone());

        // Request/response correlation: a reply is consumed by its waiter
        // instead of being dispatched.
        if let Some(original) = msg.reply_to().map(str::to_string) {
            if let Some(entry) = self.pending.remove(&original) {
                let _ = entry.tx.send(msg);
                return Ok(Routed::Reply);
            }
        }

        let from = msg.from.clone();
        let routed = match msg.kind() {
            Some(MessageType::AgentRegister) => Routed::Register {
                descriptor: msg.payload()?,
                via,
            },
            Some(MessageType::AgentDiscovery) => Routed::Discovery {
                from,
                request_id: msg.id.clone(),
                probe: msg.payload()?,
                via,
            },
            Some(MessageType::AgentDiscoveryResponse) => Routed::DiscoveryResponse {
                descriptor: msg.payload()?,
                via,
            },
            Some(MessageType::TaskInvite) => Routed::Invite {
                from,
                invite: msg.payload()?,
            },
            Some(MessageType::TaskContribution) => Routed::Contribution {
                from,
                contribution: msg.payload()?,
            },
            Some(MessageType::TaskCompleted) => Routed::Completed {
                from,
                completed: msg.payload()?,
            },
            Some(MessageType::CoordinationVote) => Routed::Vote {
                from,
                vote: msg.payload()?,
            },
            Some(MessageType::CoordinationConsensus) => Routed::ConsensusNotice {
                from,
                data: msg.data,
            },
            None => Routed::Unknown {
                message_type: msg.message_type,
            },
        };
        Ok(routed)
    }

    // ── Egress ────────────────────────────────────────────────────────────────

    /// Unicast to a registered, connected agent.
    pub fn unicast(
        &self,
        to: &str,
        msg: PeerMessage,
        terminal: bool,
    ) -> Result<PushOutcome, HubError> {
        let conn = self
            .conns
            .for_identity(to)
            .ok_or_else(|| HubError::TransportUnavailable(to.to_string()))?;
        match conn.push(msg, terminal) {
            PushOutcome::Closed => Err(HubError::TransportUnavailable(to.to_string())),
            outcome => Ok(outcome),
        }
    }

    /// Send through a specific connection (pre-registration replies).
    pub fn send_via(
        &self,
        id: ConnectionId,
        msg: PeerMessage,
        terminal: bool,
    ) -> Result<PushOutcome, HubError> {
        let conn = self
            .conns
            .by_id(id)
            .ok_or_else(|| HubError::TransportUnavailable(id.to_string()))?;
        match conn.push(msg, terminal) {
            PushOutcome::Closed => Err(HubError::TransportUnavailable(id.to_string())),
            outcome => Ok(outcome),
        }
    }

    /// Fan out to every open connection.  Returns `(deliveries, drops)`.
    pub fn broadcast(&self, msg: &PeerMessage, terminal: bool) -> (usize, u64) {
        let mut sent = 0;
        let mut dropped = 0;
        for conn in self.conns.iter() {
            match conn.push(msg.clone(), terminal) {
                PushOutcome::Closed => {}
                outcome => {
                    sent += 1;
                    if outcome.dropped() {
                        dropped += 1;
                    }
                }
            }
        }
        (sent, dropped)
    }

    // ── Correlation ───────────────────────────────────────────────────────────

    /// Register interest in the reply to `message_id`.  The returned receiver
    /// fails when the table is swept past `deadline` without an answer.
    pub fn await_reply(
        &mut self,
        message_id: impl Into<String>,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<PeerMessage>, HubError> {
        if self.pending.len() >= PENDING_REPLY_CAPACITY {
            return Err(HubError::PendingFull);
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(message_id.into(), PendingEntry { tx, deadline });
        Ok(rx)
    }

    /// Drop timed-out pending entries; their waiters observe a closed channel.
    pub fn sweep_pending(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|id, entry| {
            let keep = entry.deadline > now;
            if !keep {
                debug!(%id, "pending reply timed out");
            }
            keep
        });
        before - self.pending.len()
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn connections(&mut self) -> &mut ConnectionTable {
        &mut self.conns
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn attach(&mut self, handle: ConnectionHandle) {
        self.conns.attach(handle);
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
