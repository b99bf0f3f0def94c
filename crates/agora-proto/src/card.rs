// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The discovery descriptor served at `/.well-known/agent.json`.
//!
//! The card is a pure projection of static configuration plus the host
//! identity; it is never mutated by message traffic.

use serde::{Deserialize, Serialize};

/// Literal path the card is served under.
pub const WELL_KNOWN_PATH: &str = "/.well-known/agent.json";

/// Describes the hub: who it is, where it listens, what it can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub version: String,
    pub provider: Provider,
    /// The HTTP base URL of the JSON-RPC endpoint.
    pub url: String,
    pub capabilities: CardCapabilities,
    pub skills: Vec<Skill>,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub organization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Protocol-level capabilities advertised to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
    pub state_transition_history: bool,
}

/// A distinct capability the hub can perform or dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub examples: Vec<String>,
    pub input_modes: Vec<String>,
    pub output_modes: Vec<String>,
}

fn skill(id: &str, name: &str, description: &str, tags: &[&str], examples: &[&str]) -> Skill {
    Skill {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        tags: tags.iter().map(|s| s.to_string()).collect(),
        examples: examples.iter().map(|s| s.to_string()).collect(),
        input_modes: vec!["text".to_string(), "data".to_string()],
        output_modes: vec!["text".to_string(), "data".to_string()],
    }
}

/// The skills every hub advertises; the handler seam dispatches on their ids.
pub fn builtin_skills() -> Vec<Skill> {
    vec![
        skill(
            "code-analysis",
            "Code analysis",
            "Classify errors and analyze code context from the current project",
            &["code", "errors", "analysis"],
            &["TypeError: x is not defined", "Why does this build fail?"],
        ),
        skill(
            "problem-solving",
            "Problem solving",
            "Work through a described problem and propose next steps",
            &["reasoning", "debugging"],
            &["The service returns 502 after deploy"],
        ),
        skill(
            "tool-execution",
            "Tool execution",
            "Run local developer tools on the user's behalf",
            &["tools", "automation"],
            &["Run the test suite and summarize failures"],
        ),
        skill(
            "project-understanding",
            "Project understanding",
            "Summarize structure and conventions of the current project",
            &["context", "project"],
            &["What does this repository do?"],
        ),
    ]
}
