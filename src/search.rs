//! Document-retrieval capability boundary.
//!
//! The retrieval stage asks a `SearchProvider` for documents relevant to the
//! whole query; the shared result set is read-only context for the section
//! fan-out. The provided implementation speaks the Serper search API. A
//! missing API key degrades to an empty result set with a warning instead of
//! failing the run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::errors::ExternalCallError;

/// One retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    pub title: String,
    pub link: String,
    pub content: String,
    pub unique_id: String,
}

impl Doc {
    pub fn new(title: impl Into<String>, link: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            content: content.into(),
            unique_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Web-search capability consumed by the retrieval stage.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Doc>, ExternalCallError>;
}

const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";
const DEFAULT_RESULT_COUNT: u32 = 5;

/// Serper-backed search client.
#[derive(Debug, Clone)]
pub struct SerperClient {
    http: reqwest::Client,
    api_key: Option<String>,
    num_results: u32,
}

impl SerperClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            num_results: DEFAULT_RESULT_COUNT,
        }
    }
}

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Deserialize)]
struct SerperResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
}

#[async_trait]
impl SearchProvider for SerperClient {
    async fn search(&self, query: &str) -> Result<Vec<Doc>, ExternalCallError> {
        let Some(api_key) = &self.api_key else {
            tracing::warn!("no search API key configured, continuing without external sources");
            return Ok(Vec::new());
        };

        let response = self
            .http
            .post(SERPER_ENDPOINT)
            .header("X-API-KEY", api_key)
            .json(&json!({"q": query, "num": self.num_results}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalCallError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SerperResponse = response
            .json()
            .await
            .map_err(|e| ExternalCallError::Malformed(e.to_string()))?;

        Ok(parsed
            .organic
            .into_iter()
            .map(|r| Doc::new(r.title, r.link, r.snippet))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_api_key_yields_empty_set_not_error() {
        let client = SerperClient::new(None);
        let docs = client.search("anything").await.unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn serper_response_parses_organic_results() {
        let json = r#"{"organic":[{"title":"T","snippet":"S","link":"https://x"},{"title":"U"}]}"#;
        let parsed: SerperResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.organic.len(), 2);
        assert_eq!(parsed.organic[0].title, "T");
        assert_eq!(parsed.organic[1].snippet, "");
    }

    #[test]
    fn serper_response_tolerates_missing_organic() {
        let parsed: SerperResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.organic.is_empty());
    }

    #[test]
    fn docs_get_distinct_ids() {
        let a = Doc::new("t", "l", "c");
        let b = Doc::new("t", "l", "c");
        assert_ne!(a.unique_id, b.unique_id);
    }
}
