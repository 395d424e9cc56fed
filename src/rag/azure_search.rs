use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::retriever::{RetrievalError, RetrievedDocument, Retriever};
use crate::core::config::{ConfigError, FieldMapping, IndexConfig, SearchConfig};
use crate::llm::Embedder;

/// Hybrid keyword + vector query against one Azure AI Search index.
pub struct AzureSearchRetriever {
    base_url: String,
    api_key: String,
    api_version: String,
    index: IndexConfig,
    embedder: Option<Arc<dyn Embedder>>,
    client: Client,
}

impl AzureSearchRetriever {
    pub fn new(
        search: &SearchConfig,
        index: IndexConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self, ConfigError> {
        let endpoint = search
            .endpoint
            .clone()
            .ok_or_else(|| ConfigError::Missing("search.endpoint".to_string()))?;
        let api_key = search
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::Missing("search.api_key".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(search.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::invalid("search", e.to_string()))?;

        let embedder = if index_uses_vectors(&index) {
            embedder
        } else {
            None
        };

        Ok(Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            api_key,
            api_version: search.api_version.clone(),
            index,
            embedder,
            client,
        })
    }

    async fn query_vector(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.swap_remove(0)),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(
                    "Embedding failed for index {}, falling back to keyword search: {}",
                    self.index.name,
                    err
                );
                None
            }
        }
    }
}

fn index_uses_vectors(index: &IndexConfig) -> bool {
    index.vector_search && !index.fields.vector.is_empty()
}

#[async_trait]
impl Retriever for AzureSearchRetriever {
    fn name(&self) -> &str {
        &self.index.name
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let vector = self.query_vector(query).await;
        let body = build_search_body(query, top_k, &self.index, vector.as_deref());
        let url = format!("{}/indexes/{}/docs/search", self.base_url, self.index.name);

        let response = self
            .client
            .post(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(RetrievalError::unavailable)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Unavailable(format!(
                "index {} returned {}: {}",
                self.index.name, status, text
            )));
        }

        let payload: Value = response.json().await.map_err(RetrievalError::unavailable)?;
        let documents = parse_search_results(&payload, &self.index.fields);
        tracing::debug!(
            "Index {} returned {} documents",
            self.index.name,
            documents.len()
        );

        if documents.is_empty() {
            return Err(RetrievalError::Empty);
        }
        Ok(documents)
    }
}

fn build_search_body(
    query: &str,
    top_k: usize,
    index: &IndexConfig,
    vector: Option<&[f32]>,
) -> Value {
    let fields = &index.fields;
    let select: Vec<&str> = [&fields.id, &fields.title, &fields.content, &fields.url]
        .into_iter()
        .filter(|f| !f.is_empty())
        .map(String::as_str)
        .collect();

    let mut body = json!({
        "search": query,
        "top": top_k,
        "select": select.join(","),
    });

    if let Some(obj) = body.as_object_mut() {
        if let Some(vector) = vector {
            obj.insert(
                "vectorQueries".to_string(),
                json!([{
                    "kind": "vector",
                    "vector": vector,
                    "k": top_k,
                    "fields": fields.vector,
                }]),
            );
        }
        if let Some(semantic) = &index.semantic_configuration {
            obj.insert("queryType".to_string(), json!("semantic"));
            obj.insert("semanticConfiguration".to_string(), json!(semantic));
            obj.insert("captions".to_string(), json!("extractive"));
            obj.insert("answers".to_string(), json!("extractive"));
        }
    }

    body
}

fn parse_search_results(payload: &Value, fields: &FieldMapping) -> Vec<RetrievedDocument> {
    let items = payload
        .get("value")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut documents = Vec::new();
    for item in items {
        let content = string_field(&item, &fields.content);
        if content.is_empty() {
            continue;
        }
        let score = item
            .get("@search.rerankerScore")
            .and_then(|v| v.as_f64())
            .or_else(|| item.get("@search.score").and_then(|v| v.as_f64()))
            .unwrap_or(0.0) as f32;
        let url = string_field(&item, &fields.url);

        documents.push(RetrievedDocument {
            id: string_field(&item, &fields.id),
            title: string_field(&item, &fields.title),
            content,
            score,
            url: if url.is_empty() { None } else { Some(url) },
        });
    }
    documents
}

fn string_field(item: &Value, field: &str) -> String {
    if field.is_empty() {
        return String::new();
    }
    match item.get(field) {
        Some(Value::String(s)) => s.clone(),
        // Some indexes store titles as collections (e.g. topic lists).
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
