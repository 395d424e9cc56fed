use serde::{Deserialize, Serialize};

use crate::graph::Step;
use crate::rag::RetrievedDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Route chosen by the classifier for the latest turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Retrieve,
    Direct,
    Clarify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Controller step that produced this turn; `None` for user input.
    pub step: Option<Step>,
    pub created_at: String,
}

/// Citation-sized reference to a document retrieved at some point in the thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
}

impl From<&RetrievedDocument> for DocumentRef {
    fn from(doc: &RetrievedDocument) -> Self {
        Self {
            id: doc.id.clone(),
            title: doc.title.clone(),
            url: doc.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    turns: Vec<Turn>,
    pub last_classification: Option<Classification>,
    pub documents: Vec<DocumentRef>,
    /// Question that prompted a clarification request; the user's next
    /// message is appended to it.
    pub pending_clarification: Option<String>,
    pub username: Option<String>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            turns: Vec::new(),
            last_classification: None,
            documents: Vec::new(),
            pending_clarification: None,
            username: None,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Turns are append-only; this is the only way to add one.
    pub fn push_turn(&mut self, role: Role, content: impl Into<String>, step: Option<Step>) {
        self.turns.push(Turn {
            role,
            content: content.into(),
            step,
            created_at: chrono::Utc::now().to_rfc3339(),
        });
    }

    /// Accumulates references, skipping ids already recorded.
    pub fn record_documents(&mut self, docs: &[RetrievedDocument]) {
        for doc in docs {
            if self.documents.iter().any(|known| known.id == doc.id) {
                continue;
            }
            self.documents.push(DocumentRef::from(doc));
        }
    }

    /// The last `window` user/assistant turns, oldest first.
    pub fn recent_dialogue(&self, window: usize) -> Vec<&Turn> {
        let dialogue: Vec<&Turn> = self
            .turns
            .iter()
            .filter(|t| matches!(t.role, Role::User | Role::Assistant))
            .collect();
        let skip = dialogue.len().saturating_sub(window);
        dialogue.into_iter().skip(skip).collect()
    }
}
