use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::defaults::AppConfig;
use super::error::ConfigError;
use super::paths::AppPaths;
use super::validation::validate_config;

const REDACT_PLACEHOLDER: &str = "****";

const SENSITIVE_PATTERNS: [&str; 10] = [
    "api_key",
    "secret",
    "password",
    "_token",
    "token_",
    "credential",
    "private_key",
    "access_key",
    "jwt",
    "bearer",
];

const SENSITIVE_WHITELIST: [&str; 3] = ["max_tokens", "total_tokens", "tokens"];

/// Environment variables understood by the loader, and where they land in the config tree.
const ENV_OVERRIDES: [(&str, &[&str]); 10] = [
    ("AZURE_OPENAI_API_KEY", &["llm", "api_key"]),
    ("AZURE_OPENAI_ENDPOINT", &["llm", "endpoint"]),
    ("AZURE_OPENAI_API_VERSION", &["llm", "api_version"]),
    ("AZURE_OPENAI_CHAT_DEPLOYMENT", &["llm", "chat_deployment"]),
    (
        "AZURE_OPENAI_EMBEDDING_DEPLOYMENT",
        &["llm", "embedding_deployment"],
    ),
    ("AZURE_SEARCH_ENDPOINT", &["search", "endpoint"]),
    ("AZURE_SEARCH_KEY", &["search", "api_key"]),
    ("SEARCH_INDEX_NAME", &["search", "index_name"]),
    ("HOST", &["server", "host"]),
    ("PORT", &["server", "port"]),
];

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("RAG_ASSISTANT_CONFIG_PATH") {
            return PathBuf::from(path);
        }

        let user_config = self.paths.data_dir.join("config.yml");
        if user_config.exists() {
            return user_config;
        }

        self.paths.project_root.join("config.yml")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.paths.secrets_path.clone()
    }

    /// Loads defaults, `config.yml`, `secrets.yaml` and the process environment, in that order.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with_env(|key| env::var(key).ok())
    }

    pub fn load_with_env<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = serde_json::to_value(AppConfig::default())?;
        let public_config = load_yaml_file(&self.config_path())?;
        let secrets_config = load_yaml_file(&self.secrets_path())?;
        let env_config = env_overlay(lookup);

        let merged = [public_config, secrets_config, env_config]
            .iter()
            .fold(defaults, |acc, layer| deep_merge(&acc, layer));

        let config: AppConfig = serde_json::from_value(merged)?;
        validate_config(&config)?;
        Ok(config)
    }

    pub fn redact_sensitive_values(&self, config: &AppConfig) -> Value {
        serde_json::to_value(config)
            .map(|value| redact_sensitive_values(&value))
            .unwrap_or(Value::Null)
    }
}

fn load_yaml_file(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(Map::new()));
    }

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if contents.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let value =
        serde_yaml::from_str::<Value>(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    match value {
        Value::Object(_) => Ok(value),
        _ => Ok(Value::Object(Map::new())),
    }
}

fn env_overlay<F>(lookup: F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    let mut overlay = Value::Object(Map::new());
    for (var, path) in ENV_OVERRIDES {
        let Some(raw) = lookup(var) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let leaf = match raw.parse::<u64>() {
            Ok(number) if var == "PORT" => json!(number),
            _ => Value::String(raw.to_string()),
        };
        let layer = path
            .iter()
            .rev()
            .fold(leaf, |inner, key| json!({ (*key): inner }));
        overlay = deep_merge(&overlay, &layer);
    }
    overlay
}

fn deep_merge(base: &Value, override_value: &Value) -> Value {
    match (base, override_value) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, value) in override_map {
                let merged_value = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => override_value.clone(),
    }
}

fn redact_sensitive_values(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) && !val.is_null() {
                    redacted.insert(key.clone(), Value::String(REDACT_PLACEHOLDER.to_string()));
                } else {
                    redacted.insert(key.clone(), redact_sensitive_values(val));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_values).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    if SENSITIVE_WHITELIST
        .iter()
        .any(|allowed| *allowed == key_lower)
    {
        return false;
    }
    SENSITIVE_PATTERNS
        .iter()
        .any(|pattern| key_lower.contains(pattern))
}
