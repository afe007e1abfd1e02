//! Retrieval and web-search interfaces.
//!
//! The semantic index living under `.rag_index/` is an external concern: the
//! engine only sees the [`Retriever`] trait, a search service returning
//! ranked snippets. The planner's `rag_search` tool is a thin adapter over
//! it. Web search is the same shape — a backend trait, with a disabled
//! default that surfaces as a structured tool error instead of pretending.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::{required_str, Tool, ToolError};

/// A ranked snippet returned by the retrieval index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snippet {
    /// Repo-relative source path (or document id for knowledge files).
    pub path: String,
    /// Relevance score, higher is better.
    pub score: f32,
    pub text: String,
}

/// Search service over the working repository and knowledge store.
///
/// Implementations combine semantic and lexical search however they like;
/// the engine treats the result as an ordered list.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Snippet>, ToolError>;
}

/// `rag_search` tool: ranked snippets from the retrieval index.
pub struct RagSearch {
    retriever: Arc<dyn Retriever>,
}

impl RagSearch {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for RagSearch {
    fn name(&self) -> &str {
        "rag_search"
    }
    fn description(&self) -> &str {
        "Semantic + lexical search over the repository; returns ranked snippets"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "default": 5}
            },
            "required": ["query"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let query = required_str(&args, "query", self.name())?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .min(20) as usize;
        let snippets = self.retriever.search(query, limit).await?;
        Ok(json!({
            "query": query,
            "snippets": snippets
        }))
    }
}

/// External web-search capability.
#[async_trait]
pub trait WebSearchBackend: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Snippet>, ToolError>;
}

/// Default backend when no provider is configured.
///
/// Surfaces as a structured `Unavailable` error so the agent sees an honest
/// failure instead of empty results.
pub struct DisabledWebSearch;

#[async_trait]
impl WebSearchBackend for DisabledWebSearch {
    async fn search(&self, _query: &str) -> Result<Vec<Snippet>, ToolError> {
        Err(ToolError::Unavailable {
            tool: "web_search".into(),
            reason: "no web search backend configured".into(),
        })
    }
}

/// `web_search` tool adapter.
pub struct WebSearch {
    backend: Arc<dyn WebSearchBackend>,
}

impl WebSearch {
    pub fn new(backend: Arc<dyn WebSearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "Search the web for external documentation and references"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let query = required_str(&args, "query", self.name())?;
        let results = self.backend.search(query).await?;
        Ok(json!({"query": query, "results": results}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRetriever;

    #[async_trait]
    impl Retriever for StaticRetriever {
        async fn search(&self, _query: &str, limit: usize) -> Result<Vec<Snippet>, ToolError> {
            Ok(vec![Snippet {
                path: "src/economy.rs".into(),
                score: 0.9,
                text: "resource registry".into(),
            }]
            .into_iter()
            .take(limit)
            .collect())
        }
    }

    #[tokio::test]
    async fn rag_search_wraps_retriever() {
        let tool = RagSearch::new(Arc::new(StaticRetriever));
        let out = tool
            .call(json!({"query": "resource", "limit": 3}))
            .await
            .unwrap();
        assert_eq!(out["snippets"][0]["path"], "src/economy.rs");
    }

    #[tokio::test]
    async fn disabled_web_search_is_honest() {
        let tool = WebSearch::new(Arc::new(DisabledWebSearch));
        let err = tool.call(json!({"query": "anything"})).await.unwrap_err();
        assert!(matches!(err, ToolError::Unavailable { .. }));
    }
}
