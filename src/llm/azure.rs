use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::provider::{ChatModel, Embedder, LlmError};
use super::types::{ChatReply, ChatRequest, ToolCall, ToolChoice};
use crate::core::config::{ConfigError, LlmConfig};

/// Azure OpenAI deployment client for chat completions and embeddings.
#[derive(Clone)]
pub struct AzureOpenAiClient {
    base_url: String,
    api_key: String,
    api_version: String,
    chat_deployment: String,
    embedding_deployment: Option<String>,
    temperature: f32,
    max_tokens: Option<u32>,
    client: Client,
}

impl AzureOpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| ConfigError::Missing("llm.endpoint".to_string()))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::Missing("llm.api_key".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::invalid("llm", e.to_string()))?;

        Ok(Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            api_key,
            api_version: config.api_version.clone(),
            chat_deployment: config.chat_deployment.clone(),
            embedding_deployment: config.embedding_deployment.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    pub fn has_embeddings(&self) -> bool {
        self.embedding_deployment.is_some()
    }

    fn deployment_url(&self, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}",
            self.base_url, deployment, operation
        )
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value, LlmError> {
        let res = self
            .client
            .post(url)
            .query(&[("api-version", self.api_version.as_str())])
            .header("api-key", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(res.json().await?)
    }
}

#[async_trait]
impl ChatModel for AzureOpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
        let url = self.deployment_url(&self.chat_deployment, "chat/completions");
        let body = build_chat_body(&request, self.temperature, self.max_tokens);
        tracing::debug!(
            "Chat completion: deployment={}, messages={}, tools={}",
            self.chat_deployment,
            request.messages.len(),
            request.tools.len()
        );
        let payload = self.post(&url, &body).await?;
        parse_chat_reply(&payload)
    }
}

#[async_trait]
impl Embedder for AzureOpenAiClient {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let deployment = self
            .embedding_deployment
            .as_deref()
            .ok_or_else(|| LlmError::Malformed("no embedding deployment configured".to_string()))?;
        let url = self.deployment_url(deployment, "embeddings");
        let payload = self.post(&url, &json!({ "input": inputs })).await?;
        parse_embeddings(&payload)
    }
}

pub(crate) fn build_chat_body(request: &ChatRequest, temperature: f32, max_tokens: Option<u32>) -> Value {
    let mut body = json!({
        "messages": request.messages,
        "temperature": request.temperature.unwrap_or(temperature),
    });

    if let Some(obj) = body.as_object_mut() {
        if let Some(t) = request.max_tokens.or(max_tokens) {
            obj.insert("max_tokens".to_string(), json!(t));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".to_string(), Value::Array(tools));
            let choice = match &request.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::Function(name) => json!({
                    "type": "function",
                    "function": { "name": name }
                }),
            };
            obj.insert("tool_choice".to_string(), choice);
        }
    }

    body
}

fn parse_chat_reply(payload: &Value) -> Result<ChatReply, LlmError> {
    let message = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| LlmError::Malformed("response has no choices".to_string()))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            let function = call
                .get("function")
                .ok_or_else(|| LlmError::Malformed("tool call without function".to_string()))?;
            let name = function
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| LlmError::Malformed("tool call without name".to_string()))?;
            // Arguments arrive as a JSON-encoded string.
            let arguments = match function.get("arguments") {
                Some(Value::String(raw)) if !raw.trim().is_empty() => serde_json::from_str(raw)
                    .map_err(|e| LlmError::Malformed(format!("tool arguments: {}", e)))?,
                Some(Value::Object(map)) => Value::Object(map.clone()),
                _ => json!({}),
            };
            tool_calls.push(ToolCall {
                id: call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    Ok(ChatReply {
        content,
        tool_calls,
    })
}

fn parse_embeddings(payload: &Value) -> Result<Vec<Vec<f32>>, LlmError> {
    let data = payload
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| LlmError::Malformed("embedding response has no data".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let vals = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| LlmError::Malformed("embedding item has no vector".to_string()))?;
        embeddings.push(
            vals.iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect(),
        );
    }
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ChatMessage, ToolSpec};

    #[test]
    fn chat_body_includes_tools() {
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]).with_tools(vec![ToolSpec {
            name: "retrieve_documents".to_string(),
            description: "search".to_string(),
            parameters: json!({"type": "object"}),
        }]);

        let body = build_chat_body(&request, 0.0, Some(256));

        assert_eq!(body["tools"][0]["function"]["name"], "retrieve_documents");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn forced_tool_names_the_function() {
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]).with_forced_tool(ToolSpec {
            name: "grade".to_string(),
            description: "score".to_string(),
            parameters: json!({"type": "object"}),
        });

        let body = build_chat_body(&request, 0.0, None);

        assert_eq!(body["tools"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["tool_choice"]["type"], "function");
        assert_eq!(body["tool_choice"]["function"]["name"], "grade");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn plain_body_has_no_tool_fields() {
        let body = build_chat_body(&ChatRequest::new(vec![]), 0.2, None);
        assert!(body.get("tools").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn parses_tool_call_with_string_arguments() {
        let payload = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "retrieve_documents",
                            "arguments": "{\"query\": \"leave policy\"}"
                        }
                    }]
                }
            }]
        });

        let reply = parse_chat_reply(&payload).unwrap();
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].string_arg("query"), Some("leave policy"));
    }

    #[test]
    fn rejects_response_without_choices() {
        assert!(matches!(
            parse_chat_reply(&json!({"error": "x"})),
            Err(LlmError::Malformed(_))
        ));
    }

    #[test]
    fn parses_embeddings() {
        let payload = json!({"data": [{"embedding": [0.5, 0.25]}, {"embedding": [1.0]}]});
        let vectors = parse_embeddings(&payload).unwrap();
        assert_eq!(vectors, vec![vec![0.5, 0.25], vec![1.0]]);
    }
}
