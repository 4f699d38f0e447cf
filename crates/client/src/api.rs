//! REST client for the compute service (the snapshot fetcher).
//!
//! [`ComputeApi`] wraps the service's HTTP endpoints with [`reqwest`].
//! Surfaces depend on the [`ComputeService`] trait rather than the concrete
//! client so that loops can be exercised against in-process fakes.

use async_trait::async_trait;
use llwatch_core::models::{
    ArtifactJob, BlockDetail, BlockStartAck, DigitsCreated, JobCreated, PrimeCount, PrimeRow,
    RunJob, SubmitDigits, SubmitRun, TrackedBlock,
};
use llwatch_core::types::BlockId;
use reqwest::StatusCode;

use crate::config::ClientConfig;

/// Errors from a request/response exchange.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The service answered 404 for this URL.
    #[error("Not found: {url}")]
    NotFound { url: String },

    /// The request never produced a response (connect, DNS, TLS, timeout).
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A 2xx response whose body did not match the expected shape.
    #[error("Malformed response from {url}: {source}")]
    Malformed {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// Any other non-2xx status. Carries the body for user-facing messages.
    #[error("Service rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl FetchError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::NotFound { .. } | Self::Malformed { .. } => false,
        }
    }
}

/// Operations the dashboard needs from the compute service.
#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn list_blocks(&self, limit: u32) -> Result<Vec<TrackedBlock>, FetchError>;

    async fn block_detail(&self, block_id: BlockId) -> Result<BlockDetail, FetchError>;

    async fn start_block(
        &self,
        block_id: BlockId,
        concurrency: u32,
    ) -> Result<BlockStartAck, FetchError>;

    async fn stop_block(&self, block_id: BlockId) -> Result<(), FetchError>;

    async fn recent_primes(&self, limit: u32) -> Result<Vec<PrimeRow>, FetchError>;

    async fn prime_count(&self) -> Result<u64, FetchError>;

    async fn submit_run(&self, request: &SubmitRun) -> Result<JobCreated, FetchError>;

    async fn run_status(&self, job_id: &str) -> Result<RunJob, FetchError>;

    async fn submit_digits(&self, request: &SubmitDigits) -> Result<DigitsCreated, FetchError>;

    async fn digits_status(&self, job_id: &str) -> Result<ArtifactJob, FetchError>;

    /// Download reference for a finished digits job.
    fn download_url(&self, job_id: &str) -> String;
}

/// HTTP client for one compute service instance.
pub struct ComputeApi {
    client: reqwest::Client,
    api_base: String,
}

impl ComputeApi {
    /// Create a client for `api_base`, e.g. `http://127.0.0.1:8000`.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_base)
    }

    /// Build a client honouring the configured request timeout.
    pub fn from_config(config: &ClientConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self::with_client(client, config.api_base.clone()))
    }

    /// Reuse an existing [`reqwest::Client`] (shares its connection pool).
    pub fn with_client(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = self.url(path);
        let response = self.client.get(&url).send().await?;
        Self::parse_response(&url, response).await
    }

    async fn post_json<B, T>(&self, path: &str, body: Option<&B>) -> Result<T, FetchError>
    where
        B: serde::Serialize + ?Sized + Sync,
        T: serde::de::DeserializeOwned,
    {
        let url = self.url(path);
        let mut request = self.client.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        Self::parse_response(&url, response).await
    }

    // ---- private helpers ----

    /// Map non-2xx statuses to [`FetchError`], passing 2xx responses through.
    pub(crate) async fn ensure_success(
        url: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, FetchError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FetchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Decode a JSON body, reporting shape mismatches as `Malformed`.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T, FetchError> {
        let response = Self::ensure_success(url, response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| FetchError::Malformed {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl ComputeService for ComputeApi {
    async fn list_blocks(&self, limit: u32) -> Result<Vec<TrackedBlock>, FetchError> {
        self.get_json(&format!("/blocks?limit={limit}")).await
    }

    async fn block_detail(&self, block_id: BlockId) -> Result<BlockDetail, FetchError> {
        self.get_json(&format!("/blocks/{block_id}")).await
    }

    async fn start_block(
        &self,
        block_id: BlockId,
        concurrency: u32,
    ) -> Result<BlockStartAck, FetchError> {
        let ack: BlockStartAck = self
            .post_json::<(), _>(
                &format!("/blocks/{block_id}/start?concurrency={}", concurrency.max(1)),
                None,
            )
            .await?;
        tracing::info!(block_id, scheduled = ack.scheduled, "Block start requested");
        Ok(ack)
    }

    async fn stop_block(&self, block_id: BlockId) -> Result<(), FetchError> {
        let _: serde_json::Value = self
            .post_json::<(), _>(&format!("/blocks/{block_id}/stop"), None)
            .await?;
        tracing::info!(block_id, "Block stop requested");
        Ok(())
    }

    async fn recent_primes(&self, limit: u32) -> Result<Vec<PrimeRow>, FetchError> {
        self.get_json(&format!("/primes?limit={limit}")).await
    }

    async fn prime_count(&self) -> Result<u64, FetchError> {
        let count: PrimeCount = self.get_json("/primes/count").await?;
        Ok(count.count)
    }

    async fn submit_run(&self, request: &SubmitRun) -> Result<JobCreated, FetchError> {
        let created: JobCreated = self.post_json("/jobs", Some(request)).await?;
        tracing::info!(job_id = %created.id, p = request.p, "Run submitted");
        Ok(created)
    }

    async fn run_status(&self, job_id: &str) -> Result<RunJob, FetchError> {
        self.get_json(&format!("/jobs/{job_id}")).await
    }

    async fn submit_digits(&self, request: &SubmitDigits) -> Result<DigitsCreated, FetchError> {
        let created: DigitsCreated = self.post_json("/digits", Some(request)).await?;
        tracing::info!(
            job_id = %created.id,
            p = created.p,
            estimated_digits = created.estimated_digits,
            "Digits job submitted",
        );
        Ok(created)
    }

    async fn digits_status(&self, job_id: &str) -> Result<ArtifactJob, FetchError> {
        self.get_json(&format!("/digits/{job_id}")).await
    }

    fn download_url(&self, job_id: &str) -> String {
        self.url(&format!("/digits/{job_id}/download"))
    }
}
