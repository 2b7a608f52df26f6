use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http_client::{build_http_client_with_timeout, timeout_from_secs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Tool, content)
    }
}

/// A chat-completion endpoint: ordered messages in, one assistant reply out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], temperature: Option<f32>) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        timeout_secs: u64,
    ) -> Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.unwrap_or_default(),
            model,
            client: build_http_client_with_timeout(timeout_from_secs(timeout_secs))?,
        })
    }

    /// Generate a completion using the OpenAI API format
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: Option<f32>,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature,
        };

        let mut req = self.client.post(&url).json(&request);

        // Local servers usually run without a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, messages: &[ChatMessage], temperature: Option<f32>) -> Result<String> {
        self.generate(messages, temperature).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_uses_lowercase_roles_on_the_wire() {
        let json = serde_json::to_value(ChatMessage::tool("results")).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["content"], "results");

        let parsed: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","content":"hi"}"#).unwrap();
        assert_eq!(parsed.role, ChatRole::Assistant);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let parsed = serde_json::from_str::<ChatMessage>(r#"{"role":"operator","content":"x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn request_omits_temperature_when_unset() {
        let messages = vec![ChatMessage::user("hello")];
        let request = ChatCompletionRequest {
            model: "local-model",
            messages: &messages,
            temperature: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn completion_with_null_content_reads_as_empty() {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content, None);
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = LlmClient::new(
            "http://localhost:15211/v1/".to_string(),
            None,
            "local-model".to_string(),
            5,
        )
        .unwrap();
        assert_eq!(client.api_url, "http://localhost:15211/v1");
    }
}
