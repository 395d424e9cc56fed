use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to initialize LLM client: {0}")]
    Llm(#[source] anyhow::Error),

    #[error("Failed to initialize search indexes: {0}")]
    Retrieval(#[source] anyhow::Error),

    #[error("Failed to initialize session store: {0}")]
    Store(#[source] anyhow::Error),
}
