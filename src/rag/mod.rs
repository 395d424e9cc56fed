//! Document retrieval over hosted search indexes.
//!
//! This module provides:
//! - `Retriever`: the search contract every index client implements
//! - `AzureSearchRetriever`: hybrid keyword/vector search against one index
//! - `EnsembleRetriever`: weighted rank fusion over several retrievers
//! - `RetrieverCatalog`: request scope to retriever lookup

mod azure_search;
mod catalog;
mod ensemble;
mod retriever;

pub use azure_search::AzureSearchRetriever;
pub use catalog::RetrieverCatalog;
pub use ensemble::EnsembleRetriever;
pub use retriever::{RetrievalError, RetrievedDocument, Retriever};
