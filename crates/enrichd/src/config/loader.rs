use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::Config;
use crate::db::collection_repo::is_valid_identifier;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let mut names = HashSet::new();
    for task in &config.tasks {
        if !names.insert(task.name.as_str()) {
            return Err(ConfigError::InvalidTask {
                name: task.name.clone(),
                reason: "Duplicate task name".to_string(),
            });
        }
        if task.batch_size == 0 {
            return Err(ConfigError::InvalidTask {
                name: task.name.clone(),
                reason: "batch_size must be positive".to_string(),
            });
        }
        for (field, value) in [("source", &task.source), ("target", &task.target)] {
            if !is_valid_identifier(value) {
                return Err(ConfigError::InvalidTask {
                    name: task.name.clone(),
                    reason: format!("{} '{}' is not a valid collection identifier", field, value),
                });
            }
        }
    }

    for name in &config.smoke_test_tasks {
        if !names.contains(name.as_str()) {
            return Err(ConfigError::Validation {
                message: format!("smoke_test_tasks references unknown task '{}'", name),
            });
        }
    }

    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return Err(ConfigError::Validation {
            message: "retry.max_delay_ms must not be smaller than retry.base_delay_ms".to_string(),
        });
    }

    if config.watchdog.scheduled_threshold_ms == 0 || config.watchdog.manual_threshold_ms == 0 {
        return Err(ConfigError::Validation {
            message: "watchdog thresholds must be positive".to_string(),
        });
    }

    Ok(())
}
