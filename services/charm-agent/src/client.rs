//! Control plane API client for the charm agent.
//!
//! Provides methods for communicating with the control plane:
//! - Fetching the desired charm for the workload
//! - Reporting workload status

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::charm::{DesiredSpec, WorkloadId};
use crate::config::Config;
use crate::reconciler::DesiredStateProvider;
use crate::status::{StatusPhase, StatusSink};

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    workload_id: WorkloadId,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_base_url(&config.control_plane_url, config.workload_id.clone())
    }

    /// Create a client for an explicit base URL.
    pub fn with_base_url(base_url: &str, workload_id: WorkloadId) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            workload_id,
        })
    }

    /// Fetch the charm the control plane wants deployed for this workload.
    pub async fn fetch_desired_charm(&self) -> Result<DesiredCharmResponse> {
        let url = format!("{}/v1/workloads/{}/charm", self.base_url, self.workload_id);
        debug!(url = %url, "Fetching desired charm");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to fetch desired charm");
            anyhow::bail!("Failed to fetch desired charm: {} - {}", status, body);
        }

        let desired: DesiredCharmResponse = response.json().await?;
        debug!(
            charm_url = %desired.charm_url,
            modified_version = desired.charm_modified_version,
            "Fetched desired charm"
        );

        Ok(desired)
    }

    /// Report workload status to the control plane.
    pub async fn report_status(&self, report: &StatusReport) -> Result<()> {
        let url = format!("{}/v1/workloads/{}/status", self.base_url, self.workload_id);
        debug!(
            workload_id = %self.workload_id,
            status = %report.status,
            "Reporting workload status"
        );

        let response = self.client.post(&url).json(report).send().await?;

        if !response.status().is_success() {
            let status_code = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status_code, body = %body, "Failed to report status");
            anyhow::bail!("Failed to report status: {} - {}", status_code, body);
        }

        Ok(())
    }
}

#[async_trait]
impl DesiredStateProvider for ControlPlaneClient {
    async fn desired_spec(&self, workload_id: &WorkloadId) -> Result<DesiredSpec> {
        if workload_id != &self.workload_id {
            anyhow::bail!(
                "client is bound to workload {}, not {}",
                self.workload_id,
                workload_id
            );
        }
        Ok(self.fetch_desired_charm().await?.into())
    }
}

#[async_trait]
impl StatusSink for ControlPlaneClient {
    async fn set_status(&self, phase: StatusPhase, detail: &str) -> Result<()> {
        self.report_status(&StatusReport {
            status: phase,
            info: detail.to_string(),
            reported_at: Utc::now(),
        })
        .await
    }
}

/// Desired charm as served by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredCharmResponse {
    pub charm_url: String,
    pub sha256: String,
    pub charm_modified_version: i64,
}

impl From<DesiredCharmResponse> for DesiredSpec {
    fn from(response: DesiredCharmResponse) -> Self {
        Self {
            locator: response.charm_url,
            content_digest: response.sha256,
            modification_generation: response.charm_modified_version,
        }
    }
}

/// Workload status update sent to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: StatusPhase,
    pub info: String,
    pub reported_at: DateTime<Utc>,
}
