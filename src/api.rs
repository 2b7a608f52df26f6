use anyhow::{Context, Result};
use serde::Serialize;

use companion_backend::agent::{TurnRequest, TurnResponse};
use companion_backend::database::{ChatSummary, ChatTranscript};
use companion_backend::llm_client::ChatMessage;
use companion_backend::memory::MemoryRecord;
use companion_backend::personas::Persona;
use companion_backend::profile::Profile;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8787";

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SaveChatRequest<'a> {
    title: &'a str,
    messages: &'a [ChatMessage],
    persona_id: &'a str,
}

#[derive(Serialize)]
struct UpdateChatRequest<'a> {
    messages: &'a [ChatMessage],
    persona_id: &'a str,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("COMPANION_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        Self::new(base)
    }

    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(&base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn send_turn(&self, request: &TurnRequest) -> Result<TurnResponse> {
        self.request(reqwest::Method::POST, "/api/chat")
            .json(request)
            .send()
            .await?
            .error_for_status()
            .context("POST /api/chat failed")?
            .json::<TurnResponse>()
            .await
            .context("Failed to decode chat turn response")
    }

    pub async fn list_personas(&self) -> Result<Vec<Persona>> {
        self.request(reqwest::Method::GET, "/api/personas")
            .send()
            .await?
            .error_for_status()
            .context("GET /api/personas failed")?
            .json::<Vec<Persona>>()
            .await
            .context("Failed to decode persona list")
    }

    pub async fn get_profile(&self) -> Result<Profile> {
        self.request(reqwest::Method::GET, "/api/profile")
            .send()
            .await?
            .error_for_status()
            .context("GET /api/profile failed")?
            .json::<Profile>()
            .await
            .context("Failed to decode profile")
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        self.request(reqwest::Method::GET, "/api/chats")
            .send()
            .await?
            .error_for_status()
            .context("GET /api/chats failed")?
            .json::<Vec<ChatSummary>>()
            .await
            .context("Failed to decode chat list")
    }

    pub async fn save_chat(
        &self,
        title: &str,
        messages: &[ChatMessage],
        persona_id: &str,
    ) -> Result<ChatSummary> {
        self.request(reqwest::Method::POST, "/api/chats")
            .json(&SaveChatRequest {
                title,
                messages,
                persona_id,
            })
            .send()
            .await?
            .error_for_status()
            .context("POST /api/chats failed")?
            .json::<ChatSummary>()
            .await
            .context("Failed to decode saved chat")
    }

    pub async fn update_chat(&self, id: i64, messages: &[ChatMessage], persona_id: &str) -> Result<()> {
        self.request(reqwest::Method::PUT, &format!("/api/chats/{}", id))
            .json(&UpdateChatRequest {
                messages,
                persona_id,
            })
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("PUT /api/chats/{} failed", id))?;
        Ok(())
    }

    pub async fn load_chat(&self, id: i64) -> Result<ChatTranscript> {
        self.request(reqwest::Method::GET, &format!("/api/chats/{}", id))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("GET /api/chats/{} failed", id))?
            .json::<ChatTranscript>()
            .await
            .context("Failed to decode chat transcript")
    }

    pub async fn delete_chat(&self, id: i64) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/api/chats/{}", id))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("DELETE /api/chats/{} failed", id))?;
        Ok(())
    }

    pub async fn list_memories(&self) -> Result<Vec<MemoryRecord>> {
        self.request(reqwest::Method::GET, "/api/memories")
            .send()
            .await?
            .error_for_status()
            .context("GET /api/memories failed")?
            .json::<Vec<MemoryRecord>>()
            .await
            .context("Failed to decode memory list")
    }

    pub async fn delete_memory(&self, id: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/api/memories/{}", id))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("DELETE /api/memories/{} failed", id))?;
        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http.request(method, url)
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}
