//! The turn processor.
//!
//! One call to [`Agent::process_turn`] handles one HTTP round-trip. A turn is
//! either fresh (no continuation: assemble context, call the model) or the
//! resumption of a decision the user was asked to make. Nothing is held in
//! memory between calls; the client carries the whole history.

pub mod context;
pub mod curator;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::config::{BackendConfig, ToolCallParsing};
use crate::embedding::Embedder;
use crate::llm_client::{ChatMessage, ChatModel};
use crate::memory::MemoryStore;
use crate::personas::PersonaStore;
use crate::profile::ProfileStore;
use crate::tools::approval::{Confirmation, ConfirmationGate, Continuation, PhaseTracker, TurnPhase};
use crate::tools::web_search::WebSearch;

use self::context::{install_system_prompt, retrieval_query, ContextAssembler};
use self::curator::MemoryCurator;

const ERROR_REPLY: &str = "Sorry, I encountered an error.";

/// Everything a turn talks to, built once at startup.
#[derive(Clone)]
pub struct TurnServices {
    pub llm: Arc<dyn ChatModel>,
    pub embedder: Arc<dyn Embedder>,
    pub memory: Arc<dyn MemoryStore>,
    pub search: Arc<dyn WebSearch>,
    pub personas: Arc<PersonaStore>,
    pub profile: Arc<ProfileStore>,
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub memory_top_k: usize,
    pub tool_call_parsing: ToolCallParsing,
    pub default_persona_id: String,
}

impl AgentOptions {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            memory_top_k: config.memory_top_k,
            tool_call_parsing: config.tool_call_parsing,
            default_persona_id: config.default_persona_id.clone(),
        }
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self::from_config(&BackendConfig::default())
    }
}

fn default_provider() -> String {
    "brave".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(rename = "webSearchEnabled", default = "default_true")]
    pub web_search_enabled: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            web_search_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<Continuation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<TurnSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
}

impl TurnResponse {
    fn unchanged(history: Vec<ChatMessage>) -> Self {
        Self {
            history,
            confirmation: None,
        }
    }
}

/// Request problems the caller can fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    EmptyHistory,
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::EmptyHistory => f.write_str("history must contain at least one message"),
        }
    }
}

impl std::error::Error for TurnError {}

pub struct Agent {
    llm: Arc<dyn ChatModel>,
    assembler: ContextAssembler,
    gate: ConfirmationGate,
    curator: MemoryCurator,
    default_persona_id: String,
}

impl Agent {
    pub fn new(services: TurnServices, options: AgentOptions) -> Self {
        let assembler = ContextAssembler::new(
            services.memory.clone(),
            services.embedder.clone(),
            services.personas.clone(),
            services.profile.clone(),
            options.memory_top_k,
        );
        let gate = ConfirmationGate::new(services.search.clone(), options.tool_call_parsing);
        let curator = MemoryCurator::new(
            services.llm.clone(),
            services.memory.clone(),
            services.embedder.clone(),
        );
        Self {
            llm: services.llm,
            assembler,
            gate,
            curator,
            default_persona_id: options.default_persona_id,
        }
    }

    pub async fn process_turn(&self, request: TurnRequest) -> Result<TurnResponse> {
        let TurnRequest {
            mut history,
            continuation,
            settings,
            persona_id,
        } = request;
        let settings = settings.unwrap_or_default();

        let mut phase = match continuation {
            Some(Continuation::SaveMemory { summary }) => {
                self.curator.persist(&summary).await;
                return Ok(TurnResponse::unchanged(history));
            }
            Some(Continuation::DontSaveMemory) => {
                tracing::debug!("User declined to save memory");
                return Ok(TurnResponse::unchanged(history));
            }
            Some(Continuation::ApprovedSearch { query }) => {
                let mut phase = PhaseTracker::starting_at(TurnPhase::AwaitingUserApproval);
                let next = self
                    .gate
                    .execute_search(&query, &settings.provider, &mut history)
                    .await;
                phase.advance(next);
                phase.advance(TurnPhase::AwaitingModel);
                phase
            }
            Some(Continuation::DeniedSearch) => {
                let mut phase = PhaseTracker::starting_at(TurnPhase::AwaitingUserApproval);
                phase.advance(self.gate.deny_search(&mut history));
                phase.advance(TurnPhase::AwaitingModel);
                phase
            }
            None => {
                let query = retrieval_query(&history)
                    .ok_or(TurnError::EmptyHistory)?
                    .to_string();
                let persona_id = persona_id.as_deref().unwrap_or(&self.default_persona_id);
                let now = Local::now().naive_local();
                let prompt = self.assembler.assemble(persona_id, &query, &now).await;
                install_system_prompt(&mut history, prompt);
                PhaseTracker::starting_at(TurnPhase::AwaitingModel)
            }
        };

        let reply = match self.llm.complete(&history, None).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("An error occurred with the LLM API call: {:#}", e);
                history.push(ChatMessage::assistant(ERROR_REPLY));
                return Ok(TurnResponse::unchanged(history));
            }
        };
        history.push(ChatMessage::assistant(reply.as_str()));

        if let Some(confirmation) = self.gate.inspect(&reply, settings.web_search_enabled) {
            phase.advance(TurnPhase::ToolDetected);
            phase.advance(TurnPhase::AwaitingUserApproval);
            tracing::info!("Model requested a tool call; awaiting user approval");
            log_phases(&phase);
            return Ok(TurnResponse {
                history,
                confirmation: Some(confirmation),
            });
        }

        phase.advance(TurnPhase::Final);
        log_phases(&phase);
        let confirmation = self.curator.propose(&history).await;
        Ok(TurnResponse {
            history,
            confirmation,
        })
    }
}

fn log_phases(phase: &PhaseTracker) {
    let path: Vec<String> = phase.visited().iter().map(ToString::to_string).collect();
    tracing::debug!("Turn stopped at {} ({})", phase.current(), path.join(" -> "));
}
