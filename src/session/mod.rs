//! Per-thread conversation state and its persistence.

mod sqlite;
mod state;
mod store;

pub use sqlite::SqliteSessionStore;
pub use state::{Classification, ConversationState, DocumentRef, Role, Turn};
pub use store::{Checkpoint, SessionStore, StoreError, ThreadSummary};
