//! Contract with the external workflow-execution runtime.
//!
//! Dispatch is fire-and-forget from the engine's point of view: the result
//! of each call is logged by the caller and never escalated into a
//! cycle-level failure.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// Executes a workflow once its trigger fires.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn trigger_workflow_execution(
        &self,
        workflow_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<()>;
}

/// HTTP dispatcher posting trigger payloads to the execution runtime.
pub struct HttpDispatcher {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDispatcher {
    /// The timeout bounds each dispatch call so a stalled runtime cannot
    /// hold a credential's polling cycle open.
    pub fn new(base_url: String, timeout_seconds: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to build dispatcher HTTP client")?;
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl WorkflowDispatcher for HttpDispatcher {
    async fn trigger_workflow_execution(
        &self,
        workflow_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}/api/workflows/{}/executions", self.base_url, workflow_id);

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .context("Failed to reach workflow execution runtime")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(anyhow!(
                "Execution runtime returned status {}: {}",
                status,
                body
            ));
        }

        Ok(())
    }
}
