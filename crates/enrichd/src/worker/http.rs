//! HTTP worker invoker.

use std::time::Duration;

use async_trait::async_trait;

use super::{WorkerInvoker, WorkerRequest, WorkerResponse};
use crate::config::WorkerConfig;
use crate::error::InvocationError;

/// Posts batch requests as JSON to `{base_url}/{worker}`.
pub struct HttpWorkerInvoker {
    client: reqwest::Client,
    base_url: String,
    token_env: Option<String>,
}

impl HttpWorkerInvoker {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        token_env: Option<String>,
    ) -> Result<Self, InvocationError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(InvocationError::Endpoint(format!(
                "base URL must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            token_env,
        })
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, InvocationError> {
        Self::new(
            &config.base_url,
            config.request_timeout(),
            config.token_env.clone(),
        )
    }

    /// Endpoint for a worker identifier.
    pub fn endpoint(&self, worker: &str) -> String {
        format!("{}/{}", self.base_url, worker.trim_start_matches('/'))
    }

    fn bearer_token(&self) -> Option<String> {
        let name = self.token_env.as_deref()?;
        match std::env::var(name) {
            Ok(token) if !token.is_empty() => Some(token),
            _ => {
                log::warn!("Worker token variable {} is not set", name);
                None
            }
        }
    }
}

#[async_trait]
impl WorkerInvoker for HttpWorkerInvoker {
    async fn invoke(
        &self,
        worker: &str,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, InvocationError> {
        let url = self.endpoint(worker);
        log::debug!(
            "Invoking worker {} for job {} from {}",
            url,
            request.job_id,
            request.start_from
        );

        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = self.bearer_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvocationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<WorkerResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_worker() {
        let invoker =
            HttpWorkerInvoker::new("http://localhost:9000/functions/", Duration::from_secs(5), None)
                .unwrap();
        assert_eq!(
            invoker.endpoint("enrich-summaries"),
            "http://localhost:9000/functions/enrich-summaries"
        );
        assert_eq!(
            invoker.endpoint("/enrich-tags"),
            "http://localhost:9000/functions/enrich-tags"
        );
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let result = HttpWorkerInvoker::new("ftp://example.com", Duration::from_secs(5), None);
        assert!(matches!(result, Err(InvocationError::Endpoint(_))));
    }

    #[test]
    fn test_missing_token_variable() {
        let invoker = HttpWorkerInvoker::new(
            "http://localhost:9000",
            Duration::from_secs(5),
            Some("ENRICHD_TEST_TOKEN_THAT_IS_NEVER_SET".to_string()),
        )
        .unwrap();
        assert!(invoker.bearer_token().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_transport_error() {
        let invoker =
            HttpWorkerInvoker::new("http://127.0.0.1:9", Duration::from_secs(2), None).unwrap();
        let request = WorkerRequest {
            batch_size: 1,
            start_from: 0,
            job_id: "job".to_string(),
        };
        let result = invoker.invoke("w", &request).await;
        assert!(matches!(result, Err(InvocationError::Transport(_))));
    }
}
