use super::defaults::AppConfig;
use super::error::ConfigError;

pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    require_string(&config.llm.endpoint, "llm.endpoint")?;
    require_string(&config.llm.api_key, "llm.api_key")?;
    require_string(&config.search.endpoint, "search.endpoint")?;
    require_string(&config.search.api_key, "search.api_key")?;

    let indexes = config.search.resolved_indexes();
    if indexes.is_empty() {
        return Err(ConfigError::Missing("search.index_name".to_string()));
    }
    for (idx, index) in indexes.iter().enumerate() {
        if index.name.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("search.indexes[{}].name", idx),
                "must not be empty",
            ));
        }
        if !(index.weight.is_finite() && index.weight > 0.0) {
            return Err(ConfigError::invalid(
                format!("search.indexes[{}].weight", idx),
                "must be a positive number",
            ));
        }
    }

    validate_range("search.top_k", config.search.top_k as u64, 1, 50)?;
    validate_range(
        "search.request_timeout_secs",
        config.search.request_timeout_secs,
        1,
        600,
    )?;
    validate_range(
        "llm.request_timeout_secs",
        config.llm.request_timeout_secs,
        1,
        600,
    )?;
    validate_range(
        "controller.max_rewrites",
        config.controller.max_rewrites as u64,
        0,
        5,
    )?;
    validate_range("controller.max_steps", config.controller.max_steps as u64, 4, 256)?;
    let needed = config.controller.steps_for_full_budget();
    if config.controller.max_steps < needed {
        return Err(ConfigError::invalid(
            "controller.max_steps",
            format!(
                "must be at least {} to allow {} rewrites",
                needed, config.controller.max_rewrites
            ),
        ));
    }
    validate_range(
        "store.max_connections",
        config.store.max_connections as u64,
        1,
        64,
    )?;

    if !(0.0..=2.0).contains(&config.llm.temperature) {
        return Err(ConfigError::invalid(
            "llm.temperature",
            "must be between 0 and 2",
        ));
    }

    Ok(())
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(ConfigError::Missing(field.to_string())),
    }
}

fn validate_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::invalid(
            field,
            format!("must be between {} and {}", min, max),
        ));
    }
    Ok(())
}
