// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Coordination patterns.
//!
//! Each pattern is a pair of operations over one task: `select` chooses the
//! participants at creation time, `evaluate` decides — after every
//! contribution and once more when the task deadline fires — whether the
//! gathered contributions merge into a terminal outcome.  New patterns are
//! added by extending [`PatternKind`] and the two matches below.

use agora_config::CoordinationConfig;
use agora_proto::{Participant, PatternKind};

use crate::registry::AgentRecord;
use crate::tasks::Task;

/// Participants chosen at initiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub invitees: Vec<String>,
    /// The delegate of the hierarchical pattern.
    pub coordinator: Option<String>,
}

/// Outcome of a merge evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeVerdict {
    /// Keep waiting for contributions.
    Pending,
    Completed(serde_json::Value),
    Failed(String),
    /// The deadline fired with nothing to merge.
    Expired,
}

pub trait Coordination {
    /// Choose participants from the registry's candidate list (already
    /// capability-filtered and deterministically ordered).
    fn select(&self, candidates: &[&AgentRecord], max_agents: usize) -> Selection;

    /// Try to merge. `deadline_reached` is set when the task deadline fired.
    fn evaluate(
        &self,
        task: &Task,
        cfg: &CoordinationConfig,
        deadline_reached: bool,
    ) -> MergeVerdict;
}

impl Coordination for PatternKind {
    fn select(&self, candidates: &[&AgentRecord], max_agents: usize) -> Selection {
        match self {
            PatternKind::PeerToPeer | PatternKind::Consensus => Selection {
                invitees: candidates
                    .iter()
                    .take(max_agents.max(1))
                    .map(|rec| rec.identity.clone())
                    .collect(),
                coordinator: None,
            },
            PatternKind::Hierarchical => {
                // Deterministic: the first candidate in find() order leads.
                let lead = candidates.first().map(|rec| rec.identity.clone());
                Selection {
                    invitees: lead.clone().into_iter().collect(),
                    coordinator: lead,
                }
            }
        }
    }

    fn evaluate(
        &self,
        task: &Task,
        cfg: &CoordinationConfig,
        deadline_reached: bool,
    ) -> MergeVerdict {
        match self {
            PatternKind::PeerToPeer => {
                let quorum = cfg
                    .quorum
                    .unwrap_or(task.invitees.len())
                    .clamp(1, task.invitees.len().max(1));
                if task.participants.len() >= quorum || deadline_reached {
                    MergeVerdict::Completed(merge_peer_to_peer(&task.participants))
                } else {
                    MergeVerdict::Pending
                }
            }
            PatternKind::Hierarchical => {
                let reply = task.participants.iter().find(|p| {
                    task.coordinator
                        .as_deref()
                        .is_some_and(|c| c == p.identity)
                });
                match reply {
                    // The coordinator already merged on its side; pass through.
                    Some(p) => MergeVerdict::Completed(p.contribution.clone()),
                    None if deadline_reached => MergeVerdict::Expired,
                    None => MergeVerdict::Pending,
                }
            }
            PatternKind::Consensus => {
                if !deadline_reached && task.participants.len() < task.invitees.len() {
                    return MergeVerdict::Pending;
                }
                merge_consensus(&task.participants, cfg.consensus_threshold)
            }
        }
    }
}

fn merge_peer_to_peer(participants: &[Participant]) -> serde_json::Value {
    let results: Vec<serde_json::Value> =
        participants.iter().map(|p| p.contribution.clone()).collect();
    let confidence = if results.is_empty() { 0.0 } else { 0.8 };
    serde_json::json!({
        "results": results,
        "confidence": confidence,
    })
}

/// Pick the proposal whose summed score reaches `threshold × totalScore`,
/// ties broken by earliest arrival.
fn merge_consensus(participants: &[Participant], threshold: f64) -> MergeVerdict {
    struct Tally {
        proposal: serde_json::Value,
        score: f64,
        first_arrival: usize,
    }

    let mut tallies: Vec<Tally> = Vec::new();
    let mut total = 0.0;

    for (idx, p) in participants.iter().enumerate() {
        let proposal = p
            .contribution
            .get("proposal")
            .cloned()
            .unwrap_or_else(|| p.contribution.clone());
        let score = p
            .contribution
            .get("score")
            .and_then(|s| s.as_f64())
            .unwrap_or(1.0)
            .max(0.0);
        total += score;

        let key = proposal.to_string();
        match tallies.iter_mut().find(|t| t.proposal.to_string() == key) {
            Some(t) => t.score += score,
            None => tallies.push(Tally {
                proposal,
                score,
                first_arrival: idx,
            }),
        }
    }

    if total <= 0.0 {
        return MergeVerdict::Failed("consensus not reached".to_string());
    }

    tallies.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.first_arrival.cmp(&b.first_arrival))
    });

    let winner = &tallies[0];
    if winner.score >= threshold * total {
        MergeVerdict::Completed(serde_json::json!({
            "proposal": winner.proposal,
            "score": winner.score,
            "totalScore": total,
            "confidence": winner.score / total,
        }))
    } else {
        MergeVerdict::Failed("consensus not reached".to_string())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use agora_proto::{now_ms, AgentKind, TaskState};
    use serde_json::json;

    fn record(identity: &str) -> AgentRecord {
        AgentRecord {
            identity: identity.to_string(),
            name: None,
            kind: AgentKind::Specialist,
            capabilities: vec!["code-analysis".to_string()],
            endpoint: None,
            metadata: None,
            status: crate::registry::AgentStatus::Active,
            last_seen: tokio::time::Instant::now(),
            last_seen_ms: now_ms(),
        }
    }

    fn coordination_task(pattern: PatternKind, invitees: &[&str]) -> Task {
        let mut t = Task::new("host", None, vec![], pattern, json!({}));
        t.invitees = invitees.iter().map(|s| s.to_string()).collect();
        if pattern == PatternKind::Hierarchical {
            t.coordinator = invitees.first().map(|s| s.to_string());
        }
        t.transition(TaskState::Working).unwrap();
        t
    }

    fn cfg() -> CoordinationConfig {
        CoordinationConfig::default()
    }

    #[tokio::test]
    async fn peer_to_peer_invites_every_candidate_up_to_the_cap() {
        let a = record("peer-a");
        let b = record("peer-b");
        let c = record("peer-c");
        let candidates = vec![&a, &b, &c];
        let sel = PatternKind::PeerToPeer.select(&candidates, 2);
        assert_eq!(sel.invitees, vec!["peer-a", "peer-b"]);
        assert_eq!(sel.coordinator, None);
    }

    #[tokio::test]
    async fn hierarchical_selects_the_first_candidate_as_coordinator() {
        let a = record("peer-a");
        let b = record("peer-b");
        let candidates = vec![&a, &b];
        let sel = PatternKind::Hierarchical.select(&candidates, 10);
        assert_eq!(sel.coordinator.as_deref(), Some("peer-a"));
        assert_eq!(sel.invitees, vec!["peer-a"]);
    }

    #[tokio::test]
    async fn peer_to_peer_waits_for_all_invitees_then_merges() {
        let mut t = coordination_task(PatternKind::PeerToPeer, &["peer-a", "peer-b"]);
        t.record_contribution("peer-a", json!({"answer": 1})).unwrap();
        assert_eq!(
            PatternKind::PeerToPeer.evaluate(&t, &cfg(), false),
            MergeVerdict::Pending
        );

        t.record_contribution("peer-b", json!({"answer": 2})).unwrap();
        let verdict = PatternKind::PeerToPeer.evaluate(&t, &cfg(), false);
        let MergeVerdict::Completed(result) = verdict else {
            panic!("expected completion, got {verdict:?}");
        };
        assert_eq!(result["results"].as_array().unwrap().len(), 2);
        assert_eq!(result["confidence"], 0.8);
    }

    #[tokio::test]
    async fn peer_to_peer_quorum_short_circuits() {
        let mut t = coordination_task(PatternKind::PeerToPeer, &["peer-a", "peer-b", "peer-c"]);
        t.record_contribution("peer-a", json!({})).unwrap();
        let mut c = cfg();
        c.quorum = Some(1);
        assert!(matches!(
            PatternKind::PeerToPeer.evaluate(&t, &c, false),
            MergeVerdict::Completed(_)
        ));
    }

    #[tokio::test]
    async fn peer_to_peer_merges_with_zero_confidence_on_empty_timeout() {
        let t = coordination_task(PatternKind::PeerToPeer, &["peer-a"]);
        let MergeVerdict::Completed(result) =
            PatternKind::PeerToPeer.evaluate(&t, &cfg(), true)
        else {
            panic!("timeout must complete a peer-to-peer task");
        };
        assert_eq!(result["confidence"], 0.0);
        assert!(result["results"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hierarchical_passes_the_coordinator_reply_through() {
        let mut t = coordination_task(PatternKind::Hierarchical, &["peer-a"]);
        assert_eq!(
            PatternKind::Hierarchical.evaluate(&t, &cfg(), false),
            MergeVerdict::Pending
        );
        t.record_contribution("peer-a", json!({"merged": true})).unwrap();
        assert_eq!(
            PatternKind::Hierarchical.evaluate(&t, &cfg(), false),
            MergeVerdict::Completed(json!({"merged": true}))
        );
    }

    #[tokio::test]
    async fn hierarchical_expires_when_the_coordinator_never_replies() {
        let t = coordination_task(PatternKind::Hierarchical, &["peer-a"]);
        assert_eq!(
            PatternKind::Hierarchical.evaluate(&t, &cfg(), true),
            MergeVerdict::Expired
        );
    }

    #[tokio::test]
    async fn consensus_picks_the_proposal_over_threshold() {
        let mut t = coordination_task(
            PatternKind::Consensus,
            &["peer-a", "peer-b", "peer-c"],
        );
        t.record_contribution("peer-a", json!({"proposal": "plan-x", "score": 3.0}))
            .unwrap();
        t.record_contribution("peer-b", json!({"proposal": "plan-x", "score": 3.0}))
            .unwrap();
        t.record_contribution("peer-c", json!({"proposal": "plan-y", "score": 2.0}))
            .unwrap();

        let MergeVerdict::Completed(result) =
            PatternKind::Consensus.evaluate(&t, &cfg(), false)
        else {
            panic!("plan-x holds 6/8 = 75% ≥ 60%");
        };
        assert_eq!(result["proposal"], "plan-x");
        assert_eq!(result["score"], 6.0);
    }

    #[tokio::test]
    async fn consensus_tie_breaks_by_earliest_arrival() {
        let mut t = coordination_task(PatternKind::Consensus, &["peer-a", "peer-b"]);
        let mut c = cfg();
        c.consensus_threshold = 0.5;
        t.record_contribution("peer-a", json!({"proposal": "first", "score": 1.0}))
            .unwrap();
        t.record_contribution("peer-b", json!({"proposal": "second", "score": 1.0}))
            .unwrap();
        let MergeVerdict::Completed(result) = PatternKind::Consensus.evaluate(&t, &c, false)
        else {
            panic!("either proposal reaches 50%");
        };
        assert_eq!(result["proposal"], "first");
    }

    #[tokio::test]
    async fn consensus_fails_when_no_proposal_reaches_threshold() {
        let mut t = coordination_task(
            PatternKind::Consensus,
            &["peer-a", "peer-b", "peer-c"],
        );
        t.record_contribution("peer-a", json!({"proposal": "x", "score": 1.0}))
            .unwrap();
        t.record_contribution("peer-b", json!({"proposal": "y", "score": 1.0}))
            .unwrap();
        t.record_contribution("peer-c", json!({"proposal": "z", "score": 1.0}))
            .unwrap();
        assert_eq!(
            PatternKind::Consensus.evaluate(&t, &cfg(), false),
            MergeVerdict::Failed("consensus not reached".to_string())
        );
    }

    #[tokio::test]
    async fn consensus_on_timeout_decides_with_partial_votes() {
        let mut t = coordination_task(PatternKind::Consensus, &["peer-a", "peer-b"]);
        t.record_contribution("peer-a", json!({"proposal": "x", "score": 1.0}))
            .unwrap();
        // One vote of one is 100% of the tallied score.
        assert!(matches!(
            PatternKind::Consensus.evaluate(&t, &cfg(), true),
            MergeVerdict::Completed(_)
        ));

        let empty = coordination_task(PatternKind::Consensus, &["peer-a"]);
        assert_eq!(
            PatternKind::Consensus.evaluate(&empty, &cfg(), true),
            MergeVerdict::Failed("consensus not reached".to_string())
        );
    }
}
