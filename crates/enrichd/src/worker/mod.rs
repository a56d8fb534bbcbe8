//! External enrichment worker invocation.
//!
//! A worker is fire-and-forget: a successful call only means it accepted the
//! batch. The worker later writes `completed` or `failed` onto its own batch
//! row, and the dispatcher observes that through the store.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InvocationError;

pub use http::HttpWorkerInvoker;

/// Payload sent to a worker for one batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub batch_size: u32,
    pub start_from: u64,
    pub job_id: String,
}

/// Immediate answer from a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn started() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Turns a `success: false` answer into an invocation error.
    pub fn into_result(self) -> Result<Self, InvocationError> {
        if self.success {
            Ok(self)
        } else {
            Err(InvocationError::Rejected(
                self.error
                    .unwrap_or_else(|| "worker responded with success=false".to_string()),
            ))
        }
    }
}

/// Starts a worker on a batch.
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    async fn invoke(
        &self,
        worker: &str,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, InvocationError>;
}
