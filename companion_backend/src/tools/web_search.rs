//! Web search providers.
//!
//! Results come back as newline-joined snippets. Provider failures are
//! reported as text (`Brave Search failed: ...`) so the model can still
//! answer; nothing here returns an error to the turn processor.

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::http_client::{build_http_client_with_timeout, timeout_from_secs};

const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";
const DDG_HTML_URL: &str = "https://html.duckduckgo.com/html/";
const DDG_MAX_RESULTS: usize = 5;
const NO_RESULTS: &str = "No results found.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProvider {
    #[default]
    Brave,
    Ddgs,
}

impl SearchProvider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "brave" => Some(SearchProvider::Brave),
            "ddgs" | "duckduckgo" => Some(SearchProvider::Ddgs),
            _ => None,
        }
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Never fails: provider errors come back as a descriptive string.
    async fn search(&self, query: &str, provider: SearchProvider) -> String;
}

pub struct WebSearchClient {
    client: reqwest::Client,
    brave_api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    description: String,
}

impl WebSearchClient {
    pub fn new(brave_api_key: Option<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: build_http_client_with_timeout(timeout_from_secs(timeout_secs))?,
            brave_api_key,
        })
    }

    async fn brave(&self, query: &str) -> Result<String> {
        let key = self
            .brave_api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("BRAVE_API_KEY is not configured"))?;

        let response = self
            .client
            .get(BRAVE_SEARCH_URL)
            .query(&[("q", query)])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", key)
            .send()
            .await?
            .error_for_status()?;

        let body: BraveResponse = response
            .json()
            .await
            .context("invalid Brave response body")?;
        let results = body.web.map(|web| web.results).unwrap_or_default();
        Ok(join_or_placeholder(
            results.into_iter().map(|r| r.description).collect(),
        ))
    }

    async fn duckduckgo(&self, query: &str) -> Result<String> {
        let html = self
            .client
            .get(DDG_HTML_URL)
            .query(&[("q", query)])
            .header("User-Agent", "Mozilla/5.0 (compatible; companion/0.1)")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let snippets = extract_ddg_snippets(&html, DDG_MAX_RESULTS)?;
        Ok(join_or_placeholder(snippets))
    }
}

#[async_trait]
impl WebSearch for WebSearchClient {
    async fn search(&self, query: &str, provider: SearchProvider) -> String {
        tracing::info!("Performing {:?} search for: {}", provider, query);
        match provider {
            SearchProvider::Brave => self
                .brave(query)
                .await
                .unwrap_or_else(|e| format!("Brave Search failed: {}", e)),
            SearchProvider::Ddgs => self
                .duckduckgo(query)
                .await
                .unwrap_or_else(|e| format!("DDGS search failed: {}", e)),
        }
    }
}

/// Join snippets with newlines. Brave keeps blank descriptions in the join,
/// so only a result list that renders to nothing falls back to the placeholder.
fn join_or_placeholder(snippets: Vec<String>) -> String {
    let joined = snippets.join("\n");
    if joined.is_empty() {
        NO_RESULTS.to_string()
    } else {
        joined
    }
}

/// Text of the `.result__snippet` elements on a DuckDuckGo HTML results page.
fn extract_ddg_snippets(html: &str, limit: usize) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let snippet_selector = Selector::parse("a.result__snippet")
        .map_err(|e| anyhow::anyhow!("invalid snippet selector: {:?}", e))?;

    Ok(document
        .select(&snippet_selector)
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
        .take(limit)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_uses_lowercase_names() {
        assert_eq!(
            serde_json::to_value(SearchProvider::Ddgs).unwrap(),
            serde_json::json!("ddgs")
        );
        let parsed: SearchProvider = serde_json::from_str("\"brave\"").unwrap();
        assert_eq!(parsed, SearchProvider::Brave);
        assert_eq!(SearchProvider::parse(" DDGS "), Some(SearchProvider::Ddgs));
        assert_eq!(SearchProvider::parse("bing"), None);
    }

    #[test]
    fn empty_result_list_uses_placeholder() {
        assert_eq!(join_or_placeholder(Vec::new()), "No results found.");
        assert_eq!(
            join_or_placeholder(vec!["a".to_string(), "b".to_string()]),
            "a\nb"
        );
    }

    #[test]
    fn brave_body_without_web_section_parses() {
        let body: BraveResponse = serde_json::from_str(r#"{"type":"search"}"#).unwrap();
        assert!(body.web.is_none());

        let body: BraveResponse = serde_json::from_str(
            r#"{"web":{"results":[{"title":"t","description":"Rust 1.80 released"},{"title":"u"}]}}"#,
        )
        .unwrap();
        let results = body.web.unwrap().results;
        assert_eq!(results[0].description, "Rust 1.80 released");
        assert_eq!(results[1].description, "");
    }

    #[test]
    fn extracts_ddg_snippets_and_strips_markup() {
        let html = r#"
            <div class="result">
              <a class="result__a" href="https://a.example">A</a>
              <a class="result__snippet" href="https://a.example">The <b>Rust</b> book &amp; friends</a>
            </div>
            <div class="result">
              <td class="result-snippet">not this one</td>
              <a class="result__snippet">Second   snippet</a>
            </div>
        "#;
        let snippets = extract_ddg_snippets(html, 5).unwrap();
        assert_eq!(
            snippets,
            vec!["The Rust book & friends".to_string(), "Second   snippet".to_string()]
        );
    }

    #[test]
    fn ddg_snippets_respect_limit() {
        let html: String = (0..8)
            .map(|i| format!(r#"<a class="result__snippet">s{}</a>"#, i))
            .collect();
        assert_eq!(extract_ddg_snippets(&html, 5).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn brave_without_key_reports_failure_text() {
        let client = WebSearchClient::new(None, 1).unwrap();
        let text = client.search("anything", SearchProvider::Brave).await;
        assert!(text.starts_with("Brave Search failed:"));
        assert!(text.contains("BRAVE_API_KEY"));
    }
}
