// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The agent registry: every agent the hub has seen, keyed by identity.
//!
//! The host record is held apart from the peer map so that reaping can never
//! remove it.  `lastSeen` uses the tokio clock (monotonic, pausable in
//! tests); the epoch-milliseconds mirror is what goes into descriptors.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use agora_proto::{now_ms, AgentDescriptor, AgentKind};

/// Registry status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Active,
    Expired,
}

/// One tracked agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub identity: String,
    pub name: Option<String>,
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    pub endpoint: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub status: AgentStatus,
    pub last_seen: Instant,
    pub last_seen_ms: u64,
}

impl AgentRecord {
    fn from_descriptor(desc: AgentDescriptor) -> Self {
        Self {
            identity: desc.identity,
            name: desc.name,
            kind: desc.kind,
            capabilities: desc.capabilities,
            endpoint: desc.endpoint,
            metadata: desc.metadata,
            status: AgentStatus::Active,
            last_seen: Instant::now(),
            last_seen_ms: now_ms(),
        }
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            identity: self.identity.clone(),
            name: self.name.clone(),
            kind: self.kind,
            capabilities: self.capabilities.clone(),
            endpoint: self.endpoint.clone(),
            version: None,
            metadata: self.metadata.clone(),
            timestamp: self.last_seen_ms,
        }
    }

    fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|c| self.capabilities.iter().any(|have| have == c))
    }
}

/// Mapping of identity → record, plus the host record.
#[derive(Debug)]
pub struct Registry {
    host: AgentRecord,
    agents: HashMap<String, AgentRecord>,
}

impl Registry {
    pub fn new(host: AgentDescriptor) -> Self {
        Self {
            host: AgentRecord::from_descriptor(host),
            agents: HashMap::new(),
        }
    }

    pub fn host_identity(&self) -> &str {
        &self.host.identity
    }

    /// The compact host descriptor broadcast on the discovery interval.
    pub fn host_descriptor(&self) -> AgentDescriptor {
        let mut desc = self.host.descriptor();
        desc.timestamp = now_ms();
        desc
    }

    /// Upsert from an `agent:register` (or observed descriptor).
    /// Returns `true` when the identity was not previously registered.
    pub fn register(&mut self, desc: AgentDescriptor) -> bool {
        if desc.identity == self.host.identity {
            return false;
        }
        let fresh = AgentRecord::from_descriptor(desc);
        self.agents.insert(fresh.identity.clone(), fresh).is_none()
    }

    /// Refresh `lastSeen` on any inbound message from a known identity.
    pub fn touch(&mut self, identity: &str) {
        if let Some(rec) = self.agents.get_mut(identity) {
            rec.last_seen = Instant::now();
            rec.last_seen_ms = now_ms();
            rec.status = AgentStatus::Active;
        }
    }

    pub fn get(&self, identity: &str) -> Option<&AgentRecord> {
        self.agents.get(identity)
    }

    /// All live records whose capability set is a superset of `required`,
    /// excluding the host.  Deterministic order: `lastSeen` descending, then
    /// identity ascending.
    pub fn find(&self, required: &[String], ttl: Duration) -> Vec<&AgentRecord> {
        let now = Instant::now();
        let mut out: Vec<&AgentRecord> = self
            .agents
            .values()
            .filter(|rec| rec.status == AgentStatus::Active)
            .filter(|rec| now.duration_since(rec.last_seen) <= ttl)
            .filter(|rec| rec.has_capabilities(required))
            .collect();
        out.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        out
    }

    /// Mark a record expired without waiting for the reaper (write failure).
    pub fn mark_expired(&mut self, identity: &str) {
        if let Some(rec) = self.agents.get_mut(identity) {
            rec.status = AgentStatus::Expired;
        }
    }

    /// Remove every record silent for longer than `ttl`.  Never the host.
    pub fn reap(&mut self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let dead: Vec<String> = self
            .agents
            .values()
            .filter(|rec| {
                rec.status == AgentStatus::Expired || now.duration_since(rec.last_seen) > ttl
            })
            .map(|rec| rec.identity.clone())
            .collect();
        for id in &dead {
            self.agents.remove(id);
        }
        dead
    }

    /// Count of live peers (host excluded).
    pub fn active_count(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        self.agents
            .values()
            .filter(|rec| rec.status == AgentStatus::Active)
            .filter(|rec| now.duration_since(rec.last_seen) <= ttl)
            .count()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(identity: &str, caps: &[&str]) -> AgentDescriptor {
        AgentDescriptor {
            identity: identity.to_string(),
            name: None,
            kind: AgentKind::Specialist,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            endpoint: None,
            version: None,
            metadata: None,
            timestamp: now_ms(),
        }
    }

    fn registry() -> Registry {
        let mut host = desc("host-1", &["code-analysis"]);
        host.kind = AgentKind::Host;
        Registry::new(host)
    }

    const TTL: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn register_is_an_upsert() {
        let mut r = registry();
        assert!(r.register(desc("peer-a", &["testing"])));
        assert!(!r.register(desc("peer-a", &["testing", "rust"])));
        assert_eq!(r.get("peer-a").unwrap().capabilities.len(), 2);
    }

    #[tokio::test]
    async fn find_matches_capability_supersets_only() {
        let mut r = registry();
        r.register(desc("peer-a", &["code-analysis", "testing"]));
        r.register(desc("peer-b", &["testing"]));

        let hits = r.find(&["code-analysis".to_string()], TTL);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identity, "peer-a");

        // Empty requirement matches every live peer, but never the host.
        let all = r.find(&[], TTL);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|rec| rec.identity != "host-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn find_orders_by_last_seen_then_identity() {
        let mut r = registry();
        r.register(desc("peer-b", &[]));
        r.register(desc("peer-a", &[]));
        tokio::time::advance(Duration::from_secs(1)).await;
        r.touch("peer-b");

        let hits = r.find(&[], TTL);
        assert_eq!(hits[0].identity, "peer-b", "most recently seen first");
        assert_eq!(hits[1].identity, "peer-a");

        // Equal lastSeen falls back to identity order.
        tokio::time::advance(Duration::from_secs(1)).await;
        r.touch("peer-a");
        r.touch("peer-b");
        let hits = r.find(&[], TTL);
        assert_eq!(hits[0].identity, "peer-a");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peers_disappear_from_find_before_the_reaper_runs() {
        let mut r = registry();
        r.register(desc("peer-a", &["any"]));
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(r.find(&["any".to_string()], TTL).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reap_removes_expired_but_never_the_host() {
        let mut r = registry();
        r.register(desc("peer-a", &[]));
        r.register(desc("peer-b", &[]));
        tokio::time::advance(Duration::from_secs(60)).await;
        r.touch("peer-b");
        tokio::time::advance(Duration::from_secs(90)).await;

        // peer-a has been silent for 150 s, peer-b for 90 s.
        let dead = r.reap(TTL);
        assert_eq!(dead, vec!["peer-a".to_string()]);
        assert!(r.get("peer-a").is_none());
        assert!(r.get("peer-b").is_some());
        assert_eq!(r.host_identity(), "host-1");
    }

    #[tokio::test]
    async fn mark_expired_removes_from_find_immediately() {
        let mut r = registry();
        r.register(desc("peer-a", &[]));
        r.mark_expired("peer-a");
        assert!(r.find(&[], TTL).is_empty());
        assert_eq!(r.reap(TTL), vec!["peer-a".to_string()]);
    }

    #[tokio::test]
    async fn host_cannot_be_shadowed_by_registration() {
        let mut r = registry();
        assert!(!r.register(desc("host-1", &["impostor"])));
        assert!(r.find(&[], TTL).is_empty());
    }
}
