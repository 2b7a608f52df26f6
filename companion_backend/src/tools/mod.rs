//! Tool-call detection.
//!
//! The model asks for a tool by replying with a JSON object such as
//! `{"tool_name": "web_search", "query": "..."}`. Only `web_search` is
//! recognized; any other tool name, or JSON that fails to parse, means the
//! reply is a normal final answer.

pub mod approval;
pub mod web_search;

use serde::Deserialize;

use crate::config::ToolCallParsing;

pub const WEB_SEARCH_TOOL: &str = "web_search";

/// A recognized tool invocation extracted from a model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    WebSearch { query: String },
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    tool_name: String,
    #[serde(default)]
    query: Option<serde_json::Value>,
}

/// Scan a model reply for a tool call.
pub fn detect_tool_call(reply: &str, mode: ToolCallParsing) -> Option<ToolCall> {
    let candidate = match mode {
        ToolCallParsing::Strict => strict_candidate(reply)?,
        ToolCallParsing::Lenient => lenient_candidate(reply)?,
    };

    let raw: RawToolCall = match serde_json::from_str(candidate) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!("Reply has a brace block that is not a tool call: {}", e);
            return None;
        }
    };

    if raw.tool_name != WEB_SEARCH_TOOL {
        tracing::debug!("Ignoring unknown tool '{}'", raw.tool_name);
        return None;
    }

    match raw.query {
        Some(serde_json::Value::String(query)) if !query.trim().is_empty() => {
            Some(ToolCall::WebSearch {
                query: query.trim().to_string(),
            })
        }
        _ => {
            tracing::debug!("web_search call without a usable query");
            None
        }
    }
}

/// The whole trimmed reply, optionally inside one ```json fence.
fn strict_candidate(reply: &str) -> Option<&str> {
    let trimmed = reply.trim();
    let body = match trimmed.strip_prefix("```") {
        Some(fenced) => {
            let fenced = fenced.strip_suffix("```")?;
            let fenced = fenced.strip_prefix("json").unwrap_or(fenced);
            fenced.trim()
        }
        None => trimmed,
    };
    (body.starts_with('{') && body.ends_with('}')).then_some(body)
}

/// First `{` through last `}` anywhere in the reply.
fn lenient_candidate(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}
