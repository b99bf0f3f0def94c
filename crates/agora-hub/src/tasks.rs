// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tasks and their lifecycle.
//!
//! A task is created by a requester, mutated only by the hub that created
//! it, and destroyed after `taskTimeout` in a non-terminal state (it
//! transitions to `expired`) or after the retention window past a terminal
//! state.  `statusHistory` is append-only and always begins with
//! `submitted`.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agora_proto::{now_ms, Participant, PatternKind, StatusEntry, TaskState, TaskView};

use crate::error::HubError;

/// Which transitions the lifecycle permits, besides the implicit "none out
/// of a terminal state".
fn transition_permitted(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    if from.is_terminal() || to == Submitted || to == Unknown {
        return false;
    }
    match from {
        Submitted => matches!(
            to,
            Working | InputRequired | AuthRequired | Completed | Canceled | Failed | Rejected
                | Expired
        ),
        Working => matches!(
            to,
            InputRequired | AuthRequired | Completed | Canceled | Failed | Expired
        ),
        InputRequired => matches!(to, Working | Completed | Canceled | Failed | Expired),
        AuthRequired => matches!(to, Working | Canceled | Failed | Expired),
        Unknown => false,
        _ => false,
    }
}

/// One unit of multi-agent work, owned by the creating hub.
#[derive(Debug)]
pub struct Task {
    pub id: String,
    pub context_id: String,
    pub required_capabilities: Vec<String>,
    pub requester: String,
    pub pattern: PatternKind,
    pub payload: serde_json::Value,
    /// Agents invited by the coordination pattern; only they may contribute.
    pub invitees: Vec<String>,
    /// The delegate agent of the hierarchical pattern.
    pub coordinator: Option<String>,
    pub participants: Vec<Participant>,
    pub state: TaskState,
    pub status_history: Vec<StatusEntry>,
    pub created_at: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
    /// Final aggregated artifact; set exactly when `state` is terminal.
    pub result: Option<serde_json::Value>,
    /// Cooperative cancel signal for an in-flight handler run.
    pub cancel: CancellationToken,
}

impl Task {
    pub fn new(
        requester: impl Into<String>,
        context_id: Option<String>,
        required_capabilities: Vec<String>,
        pattern: PatternKind,
        payload: serde_json::Value,
    ) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            required_capabilities,
            requester: requester.into(),
            pattern,
            payload,
            invitees: Vec::new(),
            coordinator: None,
            participants: Vec::new(),
            state: TaskState::Submitted,
            status_history: vec![StatusEntry {
                state: TaskState::Submitted,
                timestamp: now,
            }],
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Move along the lifecycle diagram; anything else is an error.
    pub fn transition(&mut self, to: TaskState) -> Result<(), HubError> {
        if !transition_permitted(self.state, to) {
            return Err(HubError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let now = now_ms();
        self.state = to;
        self.updated_at = now;
        self.status_history.push(StatusEntry {
            state: to,
            timestamp: now,
        });
        if to.is_terminal() {
            self.completed_at = Some(now);
            self.cancel.cancel();
        }
        Ok(())
    }

    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), HubError> {
        self.transition(TaskState::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    /// Terminal failure with a reason string.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), HubError> {
        self.transition(TaskState::Failed)?;
        self.result = Some(serde_json::json!({ "reason": reason.into() }));
        Ok(())
    }

    pub fn expire(&mut self) -> Result<(), HubError> {
        self.transition(TaskState::Expired)?;
        self.result = Some(serde_json::json!({ "reason": "task timeout" }));
        Ok(())
    }

    pub fn cancel_by_request(&mut self) -> Result<(), HubError> {
        if self.state.is_terminal() {
            return Err(HubError::TaskNotCancelable(self.id.clone()));
        }
        self.transition(TaskState::Canceled)?;
        self.result = Some(serde_json::json!({ "reason": "canceled by request" }));
        Ok(())
    }

    /// Record a participant's contribution.  The sender must be an invitee;
    /// the first contribution moves a submitted task to working.
    pub fn record_contribution(
        &mut self,
        identity: &str,
        contribution: serde_json::Value,
    ) -> Result<(), HubError> {
        if !self.invitees.iter().any(|i| i == identity) {
            return Err(HubError::NotInvited {
                task_id: self.id.clone(),
                identity: identity.to_string(),
            });
        }
        if self.state == TaskState::Submitted {
            self.transition(TaskState::Working)?;
        }
        self.participants.push(Participant {
            identity: identity.to_string(),
            contribution,
            submitted_at: now_ms(),
        });
        Ok(())
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            context_id: self.context_id.clone(),
            state: self.state,
            required_capabilities: self.required_capabilities.clone(),
            requester: self.requester.clone(),
            participants: self.participants.clone(),
            status_history: self.status_history.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
        }
    }
}

/// All tasks created by this hub, keyed by id.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: HashMap<String, Task>,
}

impl TaskStore {
    pub fn insert(&mut self, task: Task) -> String {
        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);
        id
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Task> {
        self.tasks.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Non-terminal task count, for `/health`.
    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new(
            "requester-1",
            None,
            vec!["code-analysis".to_string()],
            PatternKind::PeerToPeer,
            json!({"description": "review"}),
        )
    }

    #[test]
    fn history_begins_with_submitted() {
        let t = task();
        assert_eq!(t.state, TaskState::Submitted);
        assert_eq!(t.status_history.len(), 1);
        assert_eq!(t.status_history[0].state, TaskState::Submitted);
    }

    #[test]
    fn permitted_path_submitted_working_completed() {
        let mut t = task();
        t.transition(TaskState::Working).unwrap();
        t.complete(json!({"results": []})).unwrap();
        assert_eq!(t.state, TaskState::Completed);
        assert!(t.completed_at.is_some());
        assert!(t.result.is_some());
        let states: Vec<TaskState> = t.status_history.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![TaskState::Submitted, TaskState::Working, TaskState::Completed]
        );
    }

    #[test]
    fn history_timestamps_are_monotonic() {
        let mut t = task();
        t.transition(TaskState::Working).unwrap();
        t.transition(TaskState::InputRequired).unwrap();
        t.transition(TaskState::Working).unwrap();
        t.complete(json!({})).unwrap();
        let stamps: Vec<u64> = t.status_history.iter().map(|e| e.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        let mut t = task();
        t.transition(TaskState::Working).unwrap();
        t.complete(json!({})).unwrap();
        assert!(matches!(
            t.transition(TaskState::Working),
            Err(HubError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cancel_of_terminal_task_is_rejected_and_mutates_nothing() {
        let mut t = task();
        t.transition(TaskState::Working).unwrap();
        t.complete(json!({"ok": true})).unwrap();
        let history_len = t.status_history.len();
        let updated = t.updated_at;

        assert!(matches!(
            t.cancel_by_request(),
            Err(HubError::TaskNotCancelable(_))
        ));
        assert_eq!(t.state, TaskState::Completed);
        assert_eq!(t.status_history.len(), history_len);
        assert_eq!(t.updated_at, updated);
    }

    #[test]
    fn cancel_moves_any_non_terminal_state_to_canceled() {
        for prep in [TaskState::Working, TaskState::InputRequired] {
            let mut t = task();
            t.transition(TaskState::Working).unwrap();
            if prep == TaskState::InputRequired {
                t.transition(TaskState::InputRequired).unwrap();
            }
            t.cancel_by_request().unwrap();
            assert_eq!(t.state, TaskState::Canceled);
            assert_eq!(
                t.status_history.last().unwrap().state,
                TaskState::Canceled
            );
            assert!(t.cancel.is_cancelled(), "handler token must be cancelled");
        }
    }

    #[test]
    fn contributions_require_an_invitation() {
        let mut t = task();
        t.invitees = vec!["peer-a".to_string()];
        assert!(t.record_contribution("peer-b", json!({})).is_err());
        t.record_contribution("peer-a", json!({"answer": 42})).unwrap();
        assert_eq!(t.state, TaskState::Working, "first contribution starts work");
        assert_eq!(t.participants.len(), 1);
        assert_eq!(t.participants[0].identity, "peer-a");
    }

    #[test]
    fn result_is_set_exactly_in_terminal_states() {
        let mut t = task();
        assert!(t.result.is_none());
        t.transition(TaskState::Working).unwrap();
        assert!(t.result.is_none());
        t.fail("no suitable agents").unwrap();
        assert_eq!(t.result.as_ref().unwrap()["reason"], "no suitable agents");
    }

    #[test]
    fn store_counts_only_non_terminal_tasks_as_active() {
        let mut store = TaskStore::default();
        let done = {
            let mut t = task();
            t.transition(TaskState::Working).unwrap();
            t.complete(json!({})).unwrap();
            t
        };
        store.insert(done);
        store.insert(task());
        assert_eq!(store.len(), 2);
        assert_eq!(store.active_count(), 1);
    }
}
