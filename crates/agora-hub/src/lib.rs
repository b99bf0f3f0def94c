// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The coordination core of agora: agent registry, task engine, message
//! router and the handler seam, all owned by one single-writer service loop.
//!
//! # Design
//!
//! ```text
//!   HTTP handler ──┐
//!                  ├──► mpsc::Sender<HubCommand> ──► HubService
//!   WS handler   ──┘                                    │
//!   dialer ────────┘                   owns registry,   │
//!                                      tasks, history,  │
//!   HTTP handler ◄──┐                  connections      │
//!                   ├── broadcast::Receiver<HubEvent> ◄─┘
//!   WS handler    ◄─┘
//!
//!   spawned handler run ──► completion_tx ──► service (finalizes the task)
//! ```
//!
//! Transport tasks send commands via a shared mpsc channel.  The service
//! processes them **sequentially**, so no lock is ever held across an await
//! point; handler invocations run in spawned tasks and report back through an
//! internal completion channel.  Timers (agent reaping, discovery broadcast,
//! task expiry, retention, pending-reply sweep) are a single deadline queue
//! serviced by the same loop.

pub mod conn;
pub mod error;
pub mod handler;
pub mod history;
pub mod metrics;
pub mod patterns;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod tasks;

pub use conn::{ConnectionHandle, ConnectionId, PushOutcome};
pub use error::HubError;
pub use handler::{Handler, HandlerError, HandlerRequest, ProgressSink, RequestKind, StubHandler};
pub use metrics::HealthSnapshot;
pub use service::{HubCommand, HubEvent, HubHandle, HubService, TaskSpec};
