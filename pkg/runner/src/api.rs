//! Control-plane client: poll, claim, complete, realtime token.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use pkg_constants::state::CONTROL_PLANE_TIMEOUT_SECS;
use pkg_types::config::RunnerConfig;
use pkg_types::job::{ExecutionContext, ExecutionOutcome, JobNotice};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Box<ExecutionContext>),
    /// Another runner won the race.
    AlreadyClaimed,
}

/// Websocket endpoint plus the short-lived token to open it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeToken {
    pub url: String,
    pub token: String,
}

#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Next job for this runner's group, if any.
    async fn poll(&self) -> Result<Option<JobNotice>>;
    async fn claim(&self, run_id: &str) -> Result<ClaimOutcome>;
    async fn complete(&self, run_id: &str, outcome: &ExecutionOutcome) -> Result<()>;
    async fn realtime_token(&self) -> Result<RealtimeToken>;
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    job: Option<JobNotice>,
}

pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    token: String,
    runner: String,
    group: String,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, token: &str, runner: &str, group: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CONTROL_PLANE_TIMEOUT_SECS))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            runner: runner.to_string(),
            group: group.to_string(),
        })
    }

    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        Self::new(
            &config.server.url,
            &config.server.token,
            &config.name,
            &config.group,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = self.url(path);
        debug!("[api] POST {}", url);
        self.client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", url))
    }
}

async fn fail(path: &str, resp: reqwest::Response) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    anyhow::anyhow!("POST {} returned {}: {}", path, status, body.trim())
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn poll(&self) -> Result<Option<JobNotice>> {
        let path = "/api/runners/jobs/poll";
        let resp = self
            .post(path, json!({ "runnerName": self.runner, "group": self.group }))
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            s if s.is_success() => {
                let body: PollResponse = resp.json().await.context("decode poll response")?;
                Ok(body.job)
            }
            _ => Err(fail(path, resp).await),
        }
    }

    async fn claim(&self, run_id: &str) -> Result<ClaimOutcome> {
        let path = format!("/api/runners/jobs/{}/claim", run_id);
        let resp = self
            .post(&path, json!({ "runnerName": self.runner }))
            .await?;
        match resp.status() {
            StatusCode::CONFLICT => Ok(ClaimOutcome::AlreadyClaimed),
            s if s.is_success() => {
                let ctx: ExecutionContext = resp.json().await.context("decode claim response")?;
                if ctx.run_id != run_id {
                    bail!("claimed {} but got context for {}", run_id, ctx.run_id);
                }
                Ok(ClaimOutcome::Claimed(Box::new(ctx)))
            }
            _ => Err(fail(&path, resp).await),
        }
    }

    async fn complete(&self, run_id: &str, outcome: &ExecutionOutcome) -> Result<()> {
        let path = format!("/api/runners/jobs/{}/complete", run_id);
        let resp = self.post(&path, serde_json::to_value(outcome)?).await?;
        if !resp.status().is_success() {
            return Err(fail(&path, resp).await);
        }
        Ok(())
    }

    async fn realtime_token(&self) -> Result<RealtimeToken> {
        let path = "/api/runners/realtime/token";
        let resp = self
            .post(path, json!({ "runnerName": self.runner, "group": self.group }))
            .await?;
        if !resp.status().is_success() {
            return Err(fail(path, resp).await);
        }
        resp.json().await.context("decode realtime token")
    }
}
