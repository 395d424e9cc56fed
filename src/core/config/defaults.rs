//! Typed configuration and its built-in defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_OPENAI_API_VERSION: &str = "2024-06-01";
pub const DEFAULT_SEARCH_API_VERSION: &str = "2023-11-01";
pub const DEFAULT_CHAT_DEPLOYMENT: &str = "gpt-4o";
pub const DEFAULT_EMBEDDING_DEPLOYMENT: &str = "text-embedding-3-large";
pub const DEFAULT_SCOPE: &str = "all";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub controller: ControllerConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub api_version: String,
    pub chat_deployment: String,
    /// Hybrid search falls back to keyword-only when unset.
    pub embedding_deployment: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            api_version: DEFAULT_OPENAI_API_VERSION.to_string(),
            chat_deployment: DEFAULT_CHAT_DEPLOYMENT.to_string(),
            embedding_deployment: Some(DEFAULT_EMBEDDING_DEPLOYMENT.to_string()),
            temperature: 0.0,
            max_tokens: None,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub api_version: String,
    pub top_k: usize,
    /// Shorthand for a single index in the default scope.
    pub index_name: Option<String>,
    pub indexes: Vec<IndexConfig>,
    pub default_scope: String,
    pub request_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            api_version: DEFAULT_SEARCH_API_VERSION.to_string(),
            top_k: 3,
            index_name: None,
            indexes: Vec::new(),
            default_scope: DEFAULT_SCOPE.to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl SearchConfig {
    /// Configured indexes, with `index_name` promoted to a full entry when no list is given.
    pub fn resolved_indexes(&self) -> Vec<IndexConfig> {
        if !self.indexes.is_empty() {
            return self.indexes.clone();
        }
        self.index_name
            .iter()
            .map(|name| IndexConfig {
                name: name.clone(),
                ..IndexConfig::default()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub name: String,
    /// Requests whose scope equals this value search only this index.
    pub scope: String,
    /// Fusion weight when several indexes answer the same query.
    pub weight: f32,
    pub fields: FieldMapping,
    pub semantic_configuration: Option<String>,
    pub vector_search: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            scope: "default".to_string(),
            weight: 1.0,
            fields: FieldMapping::default(),
            semantic_configuration: None,
            vector_search: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub id: String,
    pub content: String,
    pub vector: String,
    pub title: String,
    pub url: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            id: "chunk_id".to_string(),
            content: "chunk".to_string(),
            vector: "text_vector".to_string(),
            title: "title".to_string(),
            url: "url".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub max_rewrites: u32,
    pub max_steps: usize,
    pub clarification_enabled: bool,
    /// Prior user/assistant turns replayed to the classifier.
    pub history_window: usize,
    pub tool_description: String,
}

impl ControllerConfig {
    /// Steps a turn needs to spend its whole rewrite budget and still
    /// generate: classify, retrieve and grade per pass, plus a rewrite or
    /// the final generation.
    pub fn steps_for_full_budget(&self) -> usize {
        4 * (self.max_rewrites as usize + 1)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_rewrites: 2,
            max_steps: 32,
            clarification_enabled: true,
            history_window: 10,
            tool_description:
                "Search and return documents from the knowledge base relevant to the user's question."
                    .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_connections: 5,
        }
    }
}
