use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::{Agent, AgentOptions, TurnServices};
use crate::config::BackendConfig;
use crate::database::ChatDatabase;
use crate::embedding::{Embedder, EmbeddingClient};
use crate::llm_client::{ChatModel, LlmClient};
use crate::memory::{MemoryStore, SqliteMemoryStore};
use crate::personas::PersonaStore;
use crate::profile::ProfileStore;
use crate::tools::web_search::{WebSearch, WebSearchClient};

pub struct BackendRuntime {
    pub config: BackendConfig,
    pub agent: Arc<Agent>,
    pub services: TurnServices,
    pub chats: Arc<ChatDatabase>,
}

/// Wires config into clients and stores. Any collaborator can be swapped
/// before `build`, otherwise the network/SQLite implementation is used.
pub struct BackendRuntimeBuilder {
    config: BackendConfig,
    llm: Option<Arc<dyn ChatModel>>,
    embedder: Option<Arc<dyn Embedder>>,
    memory: Option<Arc<dyn MemoryStore>>,
    search: Option<Arc<dyn WebSearch>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            memory: None,
            search: None,
        }
    }

    pub fn with_chat_model(mut self, llm: Arc<dyn ChatModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_memory_store(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_web_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let data_dir = std::path::PathBuf::from(&config.data_dir);
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let llm: Arc<dyn ChatModel> = match self.llm {
            Some(llm) => llm,
            None => {
                tracing::info!("LLM endpoint: {} (model {})", config.llm_api_url, config.llm_model);
                Arc::new(LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone(),
                    config.llm_model.clone(),
                    config.llm_timeout_secs,
                )?)
            }
        };

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => {
                tracing::info!(
                    "Embedding endpoint: {} ({:?}, model {})",
                    config.embedding_api_url,
                    config.embedding_api_style,
                    config.embedding_model
                );
                Arc::new(EmbeddingClient::new(
                    config.embedding_api_url.clone(),
                    config.embedding_model.clone(),
                    config.embedding_api_style,
                    config.llm_timeout_secs,
                )?)
            }
        };

        let memory: Arc<dyn MemoryStore> = match self.memory {
            Some(memory) => memory,
            None => Arc::new(SqliteMemoryStore::open(config.memory_db_path())?),
        };

        let search: Arc<dyn WebSearch> = match self.search {
            Some(search) => search,
            None => {
                if config.brave_api_key.is_none() {
                    tracing::warn!("BRAVE_API_KEY not set; Brave searches will report a failure");
                }
                Arc::new(WebSearchClient::new(
                    config.brave_api_key.clone(),
                    config.search_timeout_secs,
                )?)
            }
        };

        let services = TurnServices {
            llm,
            embedder,
            memory,
            search,
            personas: Arc::new(PersonaStore::open(config.personas_path())?),
            profile: Arc::new(ProfileStore::open(config.profile_path())?),
        };
        let chats = Arc::new(ChatDatabase::new(config.chats_db_path())?);
        let agent = Arc::new(Agent::new(
            services.clone(),
            AgentOptions::from_config(&config),
        ));

        Ok(BackendRuntime {
            config,
            agent,
            services,
            chats,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: BackendConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }
}
