// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Live peer connections and their bounded outbound queues.
//!
//! A connection is shared by the listener (which feeds inbound frames to the
//! hub) and the writer (which drains the outbound queue onto the socket);
//! its lifetime ends when either end closes or a write fails.
//!
//! # Backpressure
//!
//! The queue is bounded (`messaging.outboundQueue`, default 256).  Overflow
//! evicts the oldest queued **non-terminal** message; terminal task messages
//! are never dropped — a peer must always learn how its task ended.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use agora_proto::PeerMessage;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one WebSocket connection (inbound or dialed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What happened to a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, after evicting the oldest non-terminal message.
    DroppedOldest,
    /// The incoming non-terminal message was dropped (queue full of
    /// terminal messages).
    DroppedIncoming,
    Closed,
}

impl PushOutcome {
    pub fn dropped(self) -> bool {
        matches!(self, PushOutcome::DroppedOldest | PushOutcome::DroppedIncoming)
    }
}

#[derive(Debug)]
struct Queued {
    msg: PeerMessage,
    terminal: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    buf: VecDeque<Queued>,
    closed: bool,
}

/// Cheap-to-clone handle to one connection's outbound queue.
///
/// The hub pushes, the socket writer pops.  All operations are non-blocking
/// except [`ConnectionHandle::pop`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    capacity: usize,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: ConnectionId::next(),
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a message for this peer. `terminal` marks messages that
    /// announce a task's terminal state.
    pub fn push(&self, msg: PeerMessage, terminal: bool) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;
        {
            let mut state = match self.state.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.buf.len() >= self.capacity && !terminal {
                // Evict the oldest non-terminal entry to make room; if the
                // whole queue is terminal traffic, the newcomer loses.
                match state.buf.iter().position(|q| !q.terminal) {
                    Some(idx) => {
                        state.buf.remove(idx);
                        outcome = PushOutcome::DroppedOldest;
                    }
                    None => return PushOutcome::DroppedIncoming,
                }
            }
            state.buf.push_back(Queued { msg, terminal });
        }
        self.notify.notify_one();
        outcome
    }

    /// Await the next outbound message; `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<PeerMessage> {
        loop {
            {
                let mut state = match self.state.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(q) = state.buf.pop_front() {
                    return Some(q.msg);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        {
            let mut state = match self.state.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.closed = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        match self.state.lock() {
            Ok(g) => g.buf.len(),
            Err(poisoned) => poisoned.into_inner().buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The set of live connections, keyed by connection id, with an identity
/// index maintained as peers register.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    by_id: HashMap<ConnectionId, ConnectionHandle>,
    identity_to_conn: HashMap<String, ConnectionId>,
}

impl ConnectionTable {
    pub fn attach(&mut self, handle: ConnectionHandle) {
        self.by_id.insert(handle.id, handle);
    }

    /// Associate an agent identity with a connection (on `agent:register`).
    pub fn bind(&mut self, identity: impl Into<String>, id: ConnectionId) {
        self.identity_to_conn.insert(identity.into(), id);
    }

    pub fn by_id(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.by_id.get(&id)
    }

    pub fn for_identity(&self, identity: &str) -> Option<&ConnectionHandle> {
        self.identity_to_conn
            .get(identity)
            .and_then(|id| self.by_id.get(id))
    }

    /// Drop a connection; returns the identity that was bound to it, if any.
    pub fn detach(&mut self, id: ConnectionId) -> Option<String> {
        if let Some(handle) = self.by_id.remove(&id) {
            handle.close();
        }
        let identity = self
            .identity_to_conn
            .iter()
            .find(|(_, c)| **c == id)
            .map(|(i, _)| i.clone());
        if let Some(ref identity) = identity {
            self.identity_to_conn.remove(identity);
        }
        identity
    }

    /// Close and drop the connection bound to `identity`.
    pub fn detach_identity(&mut self, identity: &str) {
        if let Some(id) = self.identity_to_conn.remove(identity) {
            if let Some(handle) = self.by_id.remove(&id) {
                handle.close();
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
