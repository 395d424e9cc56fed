//! SessionStore trait: durable, versioned conversation checkpoints.
//!
//! Every save appends a new checkpoint with a sequence number one higher
//! than the thread's latest. Older checkpoints are kept.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::ConversationState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session database directory {} could not be created: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("session state could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("thread {thread_id} was modified concurrently (expected seq {expected:?}, found {found:?})")]
    Conflict {
        thread_id: String,
        expected: Option<i64>,
        found: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub seq: i64,
    pub state: ConversationState,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub latest_seq: i64,
    pub checkpoints: i64,
    pub updated_at: String,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Latest checkpoint of the thread, if any.
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Appends a checkpoint unconditionally and returns its sequence number.
    async fn save(&self, thread_id: &str, state: &ConversationState) -> Result<i64, StoreError>;

    /// Appends a checkpoint only if the thread's latest seq is `expected_seq`
    /// (`None` meaning the thread has no checkpoint yet).
    async fn compare_and_swap(
        &self,
        thread_id: &str,
        expected_seq: Option<i64>,
        state: &ConversationState,
    ) -> Result<i64, StoreError>;

    /// Most recently updated threads first.
    async fn list_threads(&self, limit: usize) -> Result<Vec<ThreadSummary>, StoreError>;

    /// Removes every checkpoint of the thread; `false` when none existed.
    async fn delete(&self, thread_id: &str) -> Result<bool, StoreError>;
}
