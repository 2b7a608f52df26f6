//! Confirmation gate for tool calls and memory saves.
//!
//! Nothing runs on the model's say-so alone. A detected tool call becomes a
//! [`Confirmation`] sent back to the client; the client answers on its next
//! request with a [`Continuation`], and only then does the gate act.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::web_search::{SearchProvider, WebSearch};
use super::{detect_tool_call, ToolCall};
use crate::config::ToolCallParsing;
use crate::llm_client::ChatMessage;

const INVALID_PROVIDER: &str = "Invalid search provider specified.";

/// Pending decision the client is resolving on this request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Continuation {
    ApprovedSearch { query: String },
    DeniedSearch,
    SaveMemory { summary: String },
    DontSaveMemory,
}

/// Decision the server is asking the user to make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Confirmation {
    Search { query: String },
    Memory { summary: String },
}

/// Where a turn is in the tool loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    AwaitingModel,
    ToolDetected,
    AwaitingUserApproval,
    ToolExecuted,
    ToolDenied,
    Final,
}

impl TurnPhase {
    pub fn allows(self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        matches!(
            (self, next),
            (AwaitingModel, ToolDetected)
                | (AwaitingModel, Final)
                | (ToolDetected, AwaitingUserApproval)
                | (AwaitingUserApproval, ToolExecuted)
                | (AwaitingUserApproval, ToolDenied)
                | (ToolExecuted, AwaitingModel)
                | (ToolDenied, AwaitingModel)
        )
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnPhase::AwaitingModel => "awaiting_model",
            TurnPhase::ToolDetected => "tool_detected",
            TurnPhase::AwaitingUserApproval => "awaiting_user_approval",
            TurnPhase::ToolExecuted => "tool_executed",
            TurnPhase::ToolDenied => "tool_denied",
            TurnPhase::Final => "final",
        };
        f.write_str(name)
    }
}

/// Records phase changes for one request and logs them.
#[derive(Debug)]
pub struct PhaseTracker {
    current: TurnPhase,
    history: Vec<TurnPhase>,
}

impl PhaseTracker {
    pub fn starting_at(phase: TurnPhase) -> Self {
        Self {
            current: phase,
            history: vec![phase],
        }
    }

    pub fn advance(&mut self, next: TurnPhase) {
        if !self.current.allows(next) {
            tracing::warn!("Unexpected turn phase change {} -> {}", self.current, next);
        } else {
            tracing::debug!("Turn phase {} -> {}", self.current, next);
        }
        self.current = next;
        self.history.push(next);
    }

    pub fn current(&self) -> TurnPhase {
        self.current
    }

    pub fn visited(&self) -> &[TurnPhase] {
        &self.history
    }
}

pub fn search_results_message(results: &str) -> ChatMessage {
    ChatMessage::tool(format!(
        "Here are the search results:\n\n{}\n\nPlease use these results to answer my original question.",
        results
    ))
}

pub fn search_denied_message() -> ChatMessage {
    ChatMessage::user(
        "The user has denied the web search. Please answer the previous question using only your existing knowledge.",
    )
}

pub struct ConfirmationGate {
    search: Arc<dyn WebSearch>,
    parsing: ToolCallParsing,
}

impl ConfirmationGate {
    pub fn new(search: Arc<dyn WebSearch>, parsing: ToolCallParsing) -> Self {
        Self { search, parsing }
    }

    /// Check a model reply for a tool call that needs the user's approval.
    pub fn inspect(&self, reply: &str, web_search_enabled: bool) -> Option<Confirmation> {
        if !web_search_enabled {
            return None;
        }
        match detect_tool_call(reply, self.parsing)? {
            ToolCall::WebSearch { query } => Some(Confirmation::Search { query }),
        }
    }

    /// Run an approved search and append its results for the model. An
    /// unknown provider name is reported to the model in place of results.
    pub async fn execute_search(
        &self,
        query: &str,
        provider: &str,
        history: &mut Vec<ChatMessage>,
    ) -> TurnPhase {
        let results = match SearchProvider::parse(provider) {
            Some(provider) => self.search.search(query, provider).await,
            None => {
                tracing::warn!("Unknown search provider '{}'", provider);
                INVALID_PROVIDER.to_string()
            }
        };
        history.push(search_results_message(&results));
        TurnPhase::ToolExecuted
    }

    /// Tell the model the search was refused.
    pub fn deny_search(&self, history: &mut Vec<ChatMessage>) -> TurnPhase {
        history.push(search_denied_message());
        TurnPhase::ToolDenied
    }
}
