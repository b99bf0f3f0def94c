// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The hub's one extension point: the handler that does the actual work
//! behind `message/send`.
//!
//! A handler is pure with respect to the coordination subsystem — it
//! returns a message (and optionally emits intermediate progress messages
//! through the [`ProgressSink`]); it never sends peer messages itself.
//! Cancellation is cooperative: the engine cancels the token and a
//! well-behaved handler checks it at each of its own suspension points.
//!
//! When no handler is registered the hub falls back to [`StubHandler`], a
//! heuristic classifier that keeps the task engine's semantics well-defined
//! without a real backend.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agora_proto::{AgentMessage, Part};

/// What the caller wants done; maps one-to-one onto hub skills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    ProjectUnderstanding,
    ProblemSolving,
    ToolExecution,
    CodeContext,
    EcosystemAnalysis,
    PluginContribution,
    WorkflowImprovement,
}

impl RequestKind {
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// One unit of work handed to the handler.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub kind: RequestKind,
    pub parts: Vec<Part>,
    pub context_id: String,
    pub task_id: String,
}

impl HandlerRequest {
    /// All text parts joined, the classifier's input.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Sink for intermediate progress messages.  `ProgressSink::none()` makes
/// every emit a no-op, so handlers need not care whether the caller streams.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<AgentMessage>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<AgentMessage>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn is_streaming(&self) -> bool {
        self.tx.is_some()
    }

    /// Best-effort: a gone subscriber never fails the handler.
    pub async fn emit(&self, msg: AgentMessage) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(msg).await;
        }
    }

    pub async fn emit_text(&self, text: impl Into<String>) {
        self.emit(AgentMessage::agent(vec![Part::text(text)], None))
            .await;
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler run was canceled")]
    Canceled,
}

/// The bridge to the external "actual work" collaborator.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        request: HandlerRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<AgentMessage, HandlerError>;
}

// ── Default stub ──────────────────────────────────────────────────────────────

/// Heuristic error classifier used when no real handler is registered.
pub struct StubHandler;

struct Classification {
    category: &'static str,
    suggestions: &'static [&'static str],
}

fn classify(text: &str) -> Classification {
    let t = text.to_lowercase();
    if t.contains("typeerror")
        || t.contains("referenceerror")
        || t.contains("is not defined")
        || t.contains("undefined is not")
        || t.contains("cannot read propert")
    {
        Classification {
            category: "JavaScript runtime error",
            suggestions: &[
                "Check that the variable is declared before use",
                "Verify the import or require path",
                "Add a null/undefined guard before the access",
            ],
        }
    } else if t.contains("importerror")
        || t.contains("modulenotfounderror")
        || t.contains("no module named")
    {
        Classification {
            category: "Python import error",
            suggestions: &[
                "Install the missing package into the active environment",
                "Check the module name for typos",
                "Verify PYTHONPATH includes the project root",
            ],
        }
    } else if t.contains("build failed")
        || t.contains("compilation")
        || t.contains("error[e")
        || t.contains("cannot find symbol")
        || t.contains("undefined reference")
    {
        Classification {
            category: "build error",
            suggestions: &[
                "Re-run the build with verbose output",
                "Check for missing dependencies or stale artifacts",
            ],
        }
    } else {
        Classification {
            category: "general error",
            suggestions: &[
                "Inspect the surrounding log output",
                "Reproduce with a minimal example",
            ],
        }
    }
}

#[async_trait]
impl Handler for StubHandler {
    async fn handle(
        &self,
        request: HandlerRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<AgentMessage, HandlerError> {
        progress.emit_text("Starting analysis…").await;
        if cancel.is_cancelled() {
            return Err(HandlerError::Canceled);
        }

        let text = request.text();
        let classification = classify(&text);
        progress.emit_text("Classifying failure signature").await;
        if cancel.is_cancelled() {
            return Err(HandlerError::Canceled);
        }

        progress.emit_text("Drafting suggestions").await;

        let summary = format!(
            "Detected a {}. Suggested next steps: {}.",
            classification.category,
            classification.suggestions.join("; ")
        );
        Ok(AgentMessage::agent(
            vec![Part::text(summary)],
            Some(serde_json::json!({
                "confidence": 0.85,
                "category": classification.category,
                "suggestions": classification.suggestions,
                "kind": request.kind,
            })),
        ))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
