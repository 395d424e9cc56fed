//! Retriever trait: the search contract over hosted indexes.
//!
//! The service never ranks or caches documents itself; whatever the hosted
//! index returns is passed through in its order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A document as returned by a search index for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    /// Relevance score as reported by the index (higher = better).
    pub score: f32,
    pub url: Option<String>,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The index could not be reached or refused the query.
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),

    /// The query ran but matched nothing. Callers treat this as "no grounding".
    #[error("retrieval returned no documents")]
    Empty,
}

impl RetrievalError {
    pub fn unavailable<E: std::fmt::Display>(err: E) -> Self {
        RetrievalError::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Return up to `top_k` documents for `query`, best first.
    ///
    /// An empty result is reported as `RetrievalError::Empty`, never as `Ok(vec![])`.
    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>, RetrievalError>;
}
