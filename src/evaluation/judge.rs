use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What an external judge is asked about one sample.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeRequest<'a> {
    pub sample_id: &'a str,
    pub task: &'a str,
    pub subtask: &'a str,
    pub reference: &'a str,
    pub choices: &'a [String],
    pub response: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JudgeResponse {
    pub correct: bool,
}

/// A verdict source outside this process (a grading model, a human queue, ...).
#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<bool>;
}

/// POSTs each request as JSON and expects `{"correct": bool}` back.
///
/// `timeout` bounds each whole request; it should match the per-verdict
/// timeout the comparator applies.
pub struct HttpJudge {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpJudge {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for judge")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl Judge for HttpJudge {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<bool> {
        debug!(sample_id = %request.sample_id, endpoint = %self.endpoint, "Requesting judge verdict");

        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder
            .send()
            .await
            .context("Failed to send request to judge")?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Judge returned HTTP {}: {}", status, body);
        }

        let verdict: JudgeResponse = resp
            .json()
            .await
            .context("Failed to parse judge response")?;
        Ok(verdict.correct)
    }
}

/// Remembers verdicts for identical requests within a run.
pub struct CachedJudge {
    inner: Arc<dyn Judge>,
    verdicts: DashMap<String, bool>,
}

impl CachedJudge {
    pub fn new(inner: Arc<dyn Judge>) -> Self {
        Self {
            inner,
            verdicts: DashMap::new(),
        }
    }

    pub fn cached_count(&self) -> usize {
        self.verdicts.len()
    }

    fn cache_key(request: &JudgeRequest<'_>) -> Result<String> {
        let bytes = serde_json::to_vec(request).context("Failed to serialize judge request")?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[async_trait]
impl Judge for CachedJudge {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<bool> {
        let key = Self::cache_key(request)?;
        if let Some(hit) = self.verdicts.get(&key) {
            return Ok(*hit);
        }
        let verdict = self.inner.judge(request).await?;
        self.verdicts.insert(key, verdict);
        Ok(verdict)
    }
}
