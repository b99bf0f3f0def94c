// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bounded ring of recently routed messages, kept for diagnostics.
//! Eviction is strict FIFO.

use std::collections::VecDeque;

use agora_proto::PeerMessage;

#[derive(Debug)]
pub struct MessageHistory {
    buf: VecDeque<PeerMessage>,
    capacity: usize,
}

impl MessageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, msg: PeerMessage) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(msg);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PeerMessage> {
        self.buf.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_proto::MessageType;
    use serde_json::json;

    fn msg(n: usize) -> PeerMessage {
        PeerMessage::new(
            MessageType::AgentDiscovery,
            format!("peer-{n}"),
            "host",
            json!({"n": n}),
        )
    }

    #[test]
    fn ring_keeps_exactly_the_last_n_of_2n() {
        let n = 8;
        let mut h = MessageHistory::new(n);
        for i in 0..2 * n {
            h.push(msg(i));
        }
        assert_eq!(h.len(), n);
        let froms: Vec<&str> = h.iter().map(|m| m.from.as_str()).collect();
        let expected: Vec<String> = (n..2 * n).map(|i| format!("peer-{i}")).collect();
        assert_eq!(froms, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn eviction_is_fifo() {
        let mut h = MessageHistory::new(2);
        h.push(msg(0));
        h.push(msg(1));
        h.push(msg(2));
        assert_eq!(h.iter().next().unwrap().from, "peer-1");
    }

    #[test]
    fn every_retained_message_has_required_fields() {
        let mut h = MessageHistory::new(4);
        for i in 0..6 {
            h.push(msg(i));
        }
        for m in h.iter() {
            assert!(!m.id.is_empty());
            assert!(!m.message_type.is_empty());
            assert!(!m.from.is_empty());
            assert!(!m.to.is_empty());
            assert!(m.timestamp > 0);
        }
    }
}
