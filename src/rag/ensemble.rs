use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::retriever::{RetrievalError, RetrievedDocument, Retriever};

/// Rank offset used by reciprocal-rank fusion.
const RRF_K: f32 = 60.0;

/// Fans a query out to several retrievers and fuses their rankings.
///
/// Scores of the fused documents are the weighted RRF scores, not the
/// member indexes' native scores.
pub struct EnsembleRetriever {
    name: String,
    members: Vec<(Arc<dyn Retriever>, f32)>,
}

impl EnsembleRetriever {
    pub fn new(name: impl Into<String>, members: Vec<(Arc<dyn Retriever>, f32)>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }
}

#[async_trait]
impl Retriever for EnsembleRetriever {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        if self.members.is_empty() {
            return Err(RetrievalError::Empty);
        }
        if let [(single, _)] = self.members.as_slice() {
            return single.search(query, top_k).await;
        }

        let mut rankings = Vec::with_capacity(self.members.len());
        let mut failures = Vec::new();

        for (retriever, weight) in &self.members {
            match retriever.search(query, top_k).await {
                Ok(docs) => rankings.push((docs, *weight)),
                Err(RetrievalError::Empty) => rankings.push((Vec::new(), *weight)),
                Err(RetrievalError::Unavailable(reason)) => {
                    tracing::warn!("Retriever {} unavailable: {}", retriever.name(), reason);
                    failures.push(format!("{}: {}", retriever.name(), reason));
                }
            }
        }

        if rankings.is_empty() {
            return Err(RetrievalError::Unavailable(failures.join("; ")));
        }

        let fused = reciprocal_rank_fusion(rankings, top_k);
        if fused.is_empty() {
            return Err(RetrievalError::Empty);
        }
        Ok(fused)
    }
}

/// Weighted reciprocal-rank fusion; duplicate ids keep their first-seen body.
fn reciprocal_rank_fusion(
    rankings: Vec<(Vec<RetrievedDocument>, f32)>,
    top_k: usize,
) -> Vec<RetrievedDocument> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut order: Vec<RetrievedDocument> = Vec::new();

    for (docs, weight) in rankings {
        for (rank, doc) in docs.into_iter().enumerate() {
            let key = if doc.id.is_empty() {
                doc.content.clone()
            } else {
                doc.id.clone()
            };
            let contribution = weight / (RRF_K + rank as f32 + 1.0);
            match scores.get_mut(&key) {
                Some(score) => *score += contribution,
                None => {
                    scores.insert(key, contribution);
                    order.push(doc);
                }
            }
        }
    }

    for doc in &mut order {
        let key = if doc.id.is_empty() {
            &doc.content
        } else {
            &doc.id
        };
        doc.score = scores.get(key).copied().unwrap_or_default();
    }

    // Stable sort keeps first-seen order between ties.
    order.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(top_k);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRetriever {
        name: &'static str,
        result: Result<Vec<&'static str>, &'static str>,
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        fn name(&self) -> &str {
            self.name
        }

        async fn search(
            &self,
            _query: &str,
            top_k: usize,
        ) -> Result<Vec<RetrievedDocument>, RetrievalError> {
            match &self.result {
                Ok(ids) if ids.is_empty() => Err(RetrievalError::Empty),
                Ok(ids) => Ok(ids.iter().take(top_k).map(|id| doc(id)).collect()),
                Err(reason) => Err(RetrievalError::Unavailable(reason.to_string())),
            }
        }
    }

    fn doc(id: &str) -> RetrievedDocument {
        RetrievedDocument {
            id: id.to_string(),
            title: id.to_uppercase(),
            content: format!("content of {}", id),
            score: 1.0,
            url: None,
        }
    }

    fn member(
        name: &'static str,
        result: Result<Vec<&'static str>, &'static str>,
        weight: f32,
    ) -> (Arc<dyn Retriever>, f32) {
        (Arc::new(FixedRetriever { name, result }), weight)
    }

    #[tokio::test]
    async fn fuses_and_dedups_by_id() {
        let ensemble = EnsembleRetriever::new(
            "all",
            vec![
                member("internal", Ok(vec!["a", "b"]), 0.5),
                member("external", Ok(vec!["b", "c"]), 0.5),
            ],
        );

        let docs = ensemble.search("q", 10).await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();

        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn weights_shift_the_ranking() {
        let ensemble = EnsembleRetriever::new(
            "all",
            vec![
                member("internal", Ok(vec!["a"]), 0.2),
                member("external", Ok(vec!["c"]), 0.8),
            ],
        );

        let docs = ensemble.search("q", 1).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "c");
    }

    #[tokio::test]
    async fn skips_unavailable_members() {
        let ensemble = EnsembleRetriever::new(
            "all",
            vec![
                member("internal", Err("timeout"), 0.5),
                member("external", Ok(vec!["c"]), 0.5),
            ],
        );

        let docs = ensemble.search("q", 3).await.unwrap();
        assert_eq!(docs[0].id, "c");
    }

    #[tokio::test]
    async fn all_unavailable_is_unavailable() {
        let ensemble = EnsembleRetriever::new(
            "all",
            vec![
                member("internal", Err("down"), 0.5),
                member("external", Err("down"), 0.5),
            ],
        );

        assert!(matches!(
            ensemble.search("q", 3).await,
            Err(RetrievalError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn all_empty_is_empty() {
        let ensemble = EnsembleRetriever::new(
            "all",
            vec![
                member("internal", Ok(vec![]), 0.5),
                member("external", Err("down"), 0.5),
            ],
        );

        assert!(matches!(
            ensemble.search("q", 3).await,
            Err(RetrievalError::Empty)
        ));
    }
}
