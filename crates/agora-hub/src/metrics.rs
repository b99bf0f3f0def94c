// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Cumulative counters surfaced on `/health`.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    pub messages_processed: u64,
    pub tasks_completed: u64,
    pub errors: u64,
    pub dropped_messages: u64,
    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_processed: 0,
            tasks_completed: 0,
            errors: 0,
            dropped_messages: 0,
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// The liveness snapshot returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub identity: String,
    /// Seconds since the hub started.
    pub uptime: u64,
    pub messages_processed: u64,
    pub tasks_completed: u64,
    pub errors: u64,
    pub dropped_messages: u64,
    pub active_agents: usize,
    pub active_tasks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_camel_case() {
        let snap = HealthSnapshot {
            identity: "host-1".to_string(),
            uptime: 12,
            messages_processed: 3,
            tasks_completed: 1,
            errors: 0,
            dropped_messages: 0,
            active_agents: 2,
            active_tasks: 1,
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["messagesProcessed"], 3);
        assert_eq!(v["droppedMessages"], 0);
        assert_eq!(v["activeAgents"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn uptime_tracks_the_clock() {
        let m = Metrics::new();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        assert_eq!(m.uptime_secs(), 5);
    }
}
