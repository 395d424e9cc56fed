use std::collections::HashMap;
use std::sync::Arc;

use super::azure_search::AzureSearchRetriever;
use super::ensemble::EnsembleRetriever;
use super::retriever::Retriever;
use crate::core::config::{ConfigError, SearchConfig, DEFAULT_SCOPE};
use crate::llm::Embedder;

/// Maps a request scope to the retriever that serves it.
///
/// Every index belongs to exactly one scope; the reserved scope `all`
/// fuses every configured index.
#[derive(Clone)]
pub struct RetrieverCatalog {
    scopes: HashMap<String, Arc<dyn Retriever>>,
    default_scope: String,
}

impl RetrieverCatalog {
    pub fn from_config(
        search: &SearchConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self, ConfigError> {
        let mut members = Vec::new();
        for index in search.resolved_indexes() {
            let scope = index.scope.clone();
            let weight = index.weight;
            let retriever: Arc<dyn Retriever> =
                Arc::new(AzureSearchRetriever::new(search, index, embedder.clone())?);
            members.push((scope, retriever, weight));
        }
        Ok(Self::from_members(members, &search.default_scope))
    }

    /// Builds the scope table from `(scope, retriever, weight)` triples.
    pub fn from_members(
        members: Vec<(String, Arc<dyn Retriever>, f32)>,
        default_scope: &str,
    ) -> Self {
        let mut grouped: HashMap<String, Vec<(Arc<dyn Retriever>, f32)>> = HashMap::new();
        for (scope, retriever, weight) in &members {
            grouped
                .entry(scope.to_lowercase())
                .or_default()
                .push((retriever.clone(), *weight));
        }

        let mut scopes: HashMap<String, Arc<dyn Retriever>> = grouped
            .into_iter()
            .map(|(scope, members)| {
                let retriever: Arc<dyn Retriever> =
                    Arc::new(EnsembleRetriever::new(scope.clone(), members));
                (scope, retriever)
            })
            .collect();

        if !scopes.contains_key(DEFAULT_SCOPE) {
            let everything = members
                .into_iter()
                .map(|(_, retriever, weight)| (retriever, weight))
                .collect();
            scopes.insert(
                DEFAULT_SCOPE.to_string(),
                Arc::new(EnsembleRetriever::new(DEFAULT_SCOPE, everything)),
            );
        }

        Self {
            scopes,
            default_scope: default_scope.to_lowercase(),
        }
    }

    pub fn single(retriever: Arc<dyn Retriever>) -> Self {
        Self::from_members(vec![(DEFAULT_SCOPE.to_string(), retriever, 1.0)], DEFAULT_SCOPE)
    }

    /// Unknown or absent scopes fall back to the default scope, then to `all`.
    pub fn resolve(&self, scope: Option<&str>) -> Arc<dyn Retriever> {
        let requested = scope
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        if let Some(found) = requested.as_ref().and_then(|s| self.scopes.get(s)) {
            return found.clone();
        }
        if let Some(requested) = requested {
            tracing::debug!("Unknown scope '{}', using '{}'", requested, self.default_scope);
        }

        self.scopes
            .get(&self.default_scope)
            .or_else(|| self.scopes.get(DEFAULT_SCOPE))
            .cloned()
            .unwrap_or_else(|| {
                let empty: Arc<dyn Retriever> =
                    Arc::new(EnsembleRetriever::new(DEFAULT_SCOPE, Vec::new()));
                empty
            })
    }

    pub fn scopes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scopes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::rag::retriever::{RetrievalError, RetrievedDocument};

    struct Named(&'static str);

    #[async_trait]
    impl Retriever for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn search(
            &self,
            _query: &str,
            _top_k: usize,
        ) -> Result<Vec<RetrievedDocument>, RetrievalError> {
            Ok(vec![RetrievedDocument {
                id: self.0.to_string(),
                title: String::new(),
                content: self.0.to_string(),
                score: 1.0,
                url: None,
            }])
        }
    }

    fn catalog() -> RetrieverCatalog {
        RetrieverCatalog::from_members(
            vec![
                (
                    "internal".to_string(),
                    Arc::new(Named("guidelines")) as Arc<dyn Retriever>,
                    0.5,
                ),
                (
                    "external".to_string(),
                    Arc::new(Named("regulations")) as Arc<dyn Retriever>,
                    0.5,
                ),
            ],
            "all",
        )
    }

    #[test]
    fn all_scope_is_synthesized() {
        assert_eq!(catalog().scopes(), vec!["all", "external", "internal"]);
    }

    #[tokio::test]
    async fn scope_selects_its_indexes() {
        let docs = catalog()
            .resolve(Some("Internal"))
            .search("q", 5)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "guidelines");
    }

    #[tokio::test]
    async fn unknown_scope_falls_back_to_all() {
        let docs = catalog()
            .resolve(Some("payroll"))
            .search("q", 5)
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn empty_catalog_reports_empty() {
        let catalog = RetrieverCatalog::from_members(Vec::new(), "all");
        assert!(matches!(
            catalog.resolve(None).search("q", 5).await,
            Err(RetrievalError::Empty)
        ));
    }
}
