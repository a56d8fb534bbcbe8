use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Worker invocation error: {0}")]
    Invocation(#[from] InvocationError),

    #[error("Orchestration error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid task '{name}': {reason}")]
    InvalidTask { name: String, reason: String },
}

/// Errors raised while calling an external enrichment worker.
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("Worker request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Worker responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Worker did not start the batch: {0}")]
    Rejected(String),

    #[error("Invalid worker endpoint: {0}")]
    Endpoint(String),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] crate::db::DatabaseError),

    #[error("Task {task} needs {batches} batches, more than the limit of {limit} per job")]
    TooManyBatches {
        task: String,
        batches: u64,
        limit: u32,
    },

    #[error("Processor task failed: {0}")]
    Processor(String),
}

impl OrchestratorError {
    /// True for errors caused by the caller rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::UnknownTask(_) | OrchestratorError::InvalidRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EnrichError>;
