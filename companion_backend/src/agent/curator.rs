//! Decides what, if anything, from a finished turn is worth remembering.

use std::sync::Arc;

use crate::embedding::Embedder;
use crate::llm_client::{ChatMessage, ChatModel};
use crate::memory::{remember, MemoryStore};
use crate::tools::approval::Confirmation;

const NOTHING_NEW: &str = "no new key information";

const SUMMARY_INSTRUCTION: &str = "Summarize the new facts or user preferences from the exchange above in one concise sentence. \
Only include information the user stated directly or that came from web search results. \
Leave out anything you could work out on your own (such as answers to general questions), \
anything already present in the user profile or past memories, and the current date or time. \
If nothing qualifies, reply exactly with 'No new key information'.";

/// True when a summary carries something worth storing.
pub fn is_worth_saving(summary: &str) -> bool {
    let normalized = summary.trim().to_lowercase();
    !normalized.is_empty() && !normalized.contains(NOTHING_NEW)
}

pub struct MemoryCurator {
    llm: Arc<dyn ChatModel>,
    memory: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryCurator {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        memory: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            llm,
            memory,
            embedder,
        }
    }

    /// Ask the model to summarize the last exchange. Returns a memory
    /// confirmation, or `None` when there is nothing new or the call fails.
    pub async fn propose(&self, history: &[ChatMessage]) -> Option<Confirmation> {
        let start = history.len().saturating_sub(2);
        let mut messages = history[start..].to_vec();
        messages.push(ChatMessage::user(SUMMARY_INSTRUCTION));

        let summary = match self.llm.complete(&messages, Some(0.0)).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!("Memory summarization failed: {:#}", e);
                return None;
            }
        };

        if !is_worth_saving(&summary) {
            tracing::debug!("Nothing new to remember from this turn");
            return None;
        }

        Some(Confirmation::Memory {
            summary: summary.trim().to_string(),
        })
    }

    /// Store an approved summary. Returns the new record id, or `None` when
    /// the summary is empty or the save fails.
    pub async fn persist(&self, summary: &str) -> Option<String> {
        if !is_worth_saving(summary) {
            tracing::debug!("Ignoring approved summary with no content");
            return None;
        }

        match remember(self.memory.as_ref(), self.embedder.as_ref(), summary.trim()).await {
            Ok(id) => {
                tracing::info!("Memory saved ({}): {}", id, summary.trim());
                Some(id)
            }
            Err(e) => {
                tracing::error!("Failed to save memory: {:#}", e);
                None
            }
        }
    }
}
