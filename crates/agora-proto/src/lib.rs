// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire-protocol types for the agora coordination hub.
//!
//! Everything that crosses a process boundary lives here: the peer
//! coordination [`PeerMessage`] spoken on the WebSocket fabric, the JSON-RPC
//! envelope of the HTTP front door, the discovery [`AgentCard`], and the
//! task/message objects exchanged with external clients. All types derive
//! `Serialize`/`Deserialize` and are encoded as JSON on every surface.
//!
//! The crate is deliberately free of async and I/O so that both the hub and
//! any future client binary can depend on it without dragging in a runtime.

pub mod a2a;
pub mod card;
pub mod error;
pub mod jsonrpc;
pub mod message;

pub use a2a::{
    AgentMessage, MessageSendParams, Part, Participant, Role, SendResult, StatusEntry, TaskState,
    TaskView,
};
pub use card::{builtin_skills, AgentCard, CardCapabilities, Provider, Skill, WELL_KNOWN_PATH};
pub use error::{ErrorKind, ProtoError};
pub use jsonrpc::{JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse};
pub use message::{
    now_ms, AgentDescriptor, AgentKind, CompletedPayload, ContributionPayload, DiscoveryPayload,
    InvitePayload, MessageType, PatternKind, PeerMessage, VotePayload, BROADCAST,
};
