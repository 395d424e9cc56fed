use std::sync::Arc;

use crate::core::config::{AppConfig, AppPaths};
use crate::graph::ConversationController;
use crate::grader::LlmGrader;
use crate::llm::{AzureOpenAiClient, ChatModel, Embedder};
use crate::rag::RetrieverCatalog;
use crate::session::{SessionStore, SqliteSessionStore};

pub mod error;

use error::InitializationError;

/// Shared application state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config: Arc<AppConfig>,
    pub controller: Arc<ConversationController>,
}

impl AppState {
    /// Wires the hosted model, the search indexes and the session store
    /// into a conversation controller.
    pub async fn initialize(
        config: AppConfig,
        paths: Arc<AppPaths>,
    ) -> Result<Arc<Self>, InitializationError> {
        let client = Arc::new(
            AzureOpenAiClient::from_config(&config.llm)
                .map_err(|e| InitializationError::Llm(e.into()))?,
        );
        let model: Arc<dyn ChatModel> = client.clone();
        let embedder: Option<Arc<dyn Embedder>> = if client.has_embeddings() {
            Some(client.clone() as Arc<dyn Embedder>)
        } else {
            tracing::info!("No embedding deployment configured; using keyword search only");
            None
        };

        let retrievers = RetrieverCatalog::from_config(&config.search, embedder)
            .map_err(|e| InitializationError::Retrieval(e.into()))?;
        tracing::info!("Search scopes: {}", retrievers.scopes().join(", "));

        let db_path = config
            .store
            .db_path
            .clone()
            .unwrap_or_else(|| paths.db_path.clone());
        let store: Arc<dyn SessionStore> = Arc::new(
            SqliteSessionStore::new(db_path, config.store.max_connections)
                .await
                .map_err(|e| InitializationError::Store(e.into()))?,
        );

        let controller = ConversationController::new(
            model.clone(),
            retrievers,
            Arc::new(LlmGrader::new(model)),
            store,
            config.controller.clone(),
            config.search.top_k,
        );

        Ok(Self::from_parts(config, paths, controller))
    }

    pub fn from_parts(
        config: AppConfig,
        paths: Arc<AppPaths>,
        controller: ConversationController,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            config: Arc::new(config),
            controller: Arc::new(controller),
        })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.controller.store()
    }
}
