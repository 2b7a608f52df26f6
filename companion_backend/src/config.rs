use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// How a model reply is scanned for a tool-call object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallParsing {
    /// The whole trimmed reply (optionally fenced) must be the JSON object.
    #[default]
    Strict,
    /// First `{` to last `}` anywhere in the reply.
    Lenient,
}

impl ToolCallParsing {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(ToolCallParsing::Strict),
            "lenient" | "legacy" => Some(ToolCallParsing::Lenient),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingApiStyle {
    /// `POST {base}/embeddings` with `{model, input}`
    #[default]
    Openai,
    /// `POST {base}/api/embed` with `{model, input}`
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    // LLM configuration (OpenAI-compatible: llama.cpp, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    // Embeddings
    #[serde(default = "default_embedding_url")]
    pub embedding_api_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_api_style: EmbeddingApiStyle,

    // Web search
    #[serde(default)]
    pub brave_api_key: Option<String>,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default)]
    pub tool_call_parsing: ToolCallParsing,

    // Storage (relative file names resolve against data_dir)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_chats_db_file")]
    pub chats_db_file: String,
    #[serde(default = "default_memory_db_file")]
    pub memory_db_file: String,
    #[serde(default = "default_personas_file")]
    pub personas_file: String,
    #[serde(default = "default_profile_file")]
    pub profile_file: String,

    #[serde(default = "default_persona_id")]
    pub default_persona_id: String,
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,

    // Server
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_llm_url() -> String {
    "http://localhost:15211/v1".to_string()
}

fn default_llm_model() -> String {
    "local-model".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_embedding_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_embedding_model() -> String {
    "all-minilm".to_string()
}

fn default_search_timeout_secs() -> u64 {
    10
}

fn default_data_dir() -> String {
    ".".to_string()
}

fn default_chats_db_file() -> String {
    "chats.db".to_string()
}

fn default_memory_db_file() -> String {
    "assistant_memory.db".to_string()
}

fn default_personas_file() -> String {
    "personas.json".to_string()
}

fn default_profile_file() -> String {
    "profile.json".to_string()
}

fn default_persona_id() -> String {
    "assistant".to_string()
}

fn default_memory_top_k() -> usize {
    3
}

fn default_bind_address() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://localhost:3000".to_string(),
    ]
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_timeout_secs: default_llm_timeout_secs(),
            embedding_api_url: default_embedding_url(),
            embedding_model: default_embedding_model(),
            embedding_api_style: EmbeddingApiStyle::default(),
            brave_api_key: None,
            search_timeout_secs: default_search_timeout_secs(),
            tool_call_parsing: ToolCallParsing::default(),
            data_dir: default_data_dir(),
            chats_db_file: default_chats_db_file(),
            memory_db_file: default_memory_db_file(),
            personas_file: default_personas_file(),
            profile_file: default_profile_file(),
            default_persona_id: default_persona_id(),
            memory_top_k: default_memory_top_k(),
            bind_address: default_bind_address(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl BackendConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Config file path: `COMPANION_CONFIG` if set, else `companion_config.toml` next to the executable
    pub fn config_path() -> PathBuf {
        match env::var("COMPANION_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("companion_config.toml"),
        }
    }

    /// Load the config file, then overlay environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<BackendConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    None
                }
            },
            Err(_) => None,
        };

        let base = base.unwrap_or_else(|| {
            tracing::warn!("No config file found, using defaults + env vars");
            Self::default()
        });
        base.apply_env()
    }

    fn apply_env(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Ok(secs) = env::var("LLM_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.llm_timeout_secs = secs;
            }
        }

        if let Ok(url) = env::var("EMBEDDING_API_URL") {
            self.embedding_api_url = url;
        }

        if let Ok(model) = env::var("EMBEDDING_MODEL") {
            self.embedding_model = model;
        }

        if let Ok(style) = env::var("EMBEDDING_API_STYLE") {
            match style.trim().to_ascii_lowercase().as_str() {
                "openai" => self.embedding_api_style = EmbeddingApiStyle::Openai,
                "ollama" => self.embedding_api_style = EmbeddingApiStyle::Ollama,
                other => tracing::warn!("Ignoring unknown EMBEDDING_API_STYLE '{}'", other),
            }
        }

        if let Ok(key) = env::var("BRAVE_API_KEY") {
            if !key.trim().is_empty() {
                self.brave_api_key = Some(key);
            }
        }

        if let Ok(dir) = env::var("COMPANION_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = dir;
            }
        }

        if let Ok(bind) = env::var("COMPANION_BACKEND_BIND") {
            if !bind.trim().is_empty() {
                self.bind_address = bind;
            }
        }

        if let Ok(top_k) = env::var("COMPANION_MEMORY_TOP_K") {
            if let Ok(top_k) = top_k.parse() {
                self.memory_top_k = top_k;
            }
        }

        if let Ok(mode) = env::var("COMPANION_TOOL_CALL_PARSING") {
            match ToolCallParsing::parse(&mode) {
                Some(mode) => self.tool_call_parsing = mode,
                None => tracing::warn!("Ignoring unknown COMPANION_TOOL_CALL_PARSING '{}'", mode),
            }
        }

        self
    }

    /// Resolve a configured file name against `data_dir` (absolute names pass through).
    pub fn data_path(&self, file: &str) -> PathBuf {
        let path = PathBuf::from(file);
        if path.is_absolute() {
            path
        } else {
            PathBuf::from(&self.data_dir).join(path)
        }
    }

    pub fn chats_db_path(&self) -> PathBuf {
        self.data_path(&self.chats_db_file)
    }

    pub fn memory_db_path(&self) -> PathBuf {
        self.data_path(&self.memory_db_file)
    }

    pub fn personas_path(&self) -> PathBuf {
        self.data_path(&self.personas_file)
    }

    pub fn profile_path(&self) -> PathBuf {
        self.data_path(&self.profile_file)
    }
}
