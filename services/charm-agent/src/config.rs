//! Configuration for the charm agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::charm::{DeployerConfig, HttpDownloaderConfig, WorkloadId};
use crate::reconciler::{BackoffPolicy, ReconcilerConfig, RetryPolicy};

const ENV_PREFIX: &str = "CHARM_AGENT_";

/// Charm agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workload whose charm this agent manages.
    pub workload_id: WorkloadId,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Data directory for local state and deployed charms.
    pub data_dir: PathBuf,

    /// Interval between reconciliation ticks in seconds.
    pub reconcile_interval_secs: u64,

    /// Wait policy after failed ticks.
    pub retry: RetryPolicy,

    /// Upper bound for one charm download in seconds.
    pub download_timeout_secs: u64,

    /// Largest charm archive accepted.
    pub max_archive_bytes: u64,

    /// Age after which a deploy lock is considered abandoned.
    pub lock_stale_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// `lookup` receives full variable names, e.g. `CHARM_AGENT_DATA_DIR`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        let workload_id = var("WORKLOAD_ID")
            .map(WorkloadId::new)
            .with_context(|| format!("{ENV_PREFIX}WORKLOAD_ID must be set"))?;
        if workload_id.as_str().contains('/') {
            bail!("workload id {workload_id} must not contain '/'");
        }

        let control_plane_url =
            var("CONTROL_PLANE_URL").unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let data_dir = var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/plfm-charm-agent"));

        let reconcile_interval_secs = parse_or(&var, "RECONCILE_INTERVAL_SECS", 10)?;
        let backoff_base_ms = parse_or(&var, "BACKOFF_BASE_MS", 1000)?;
        let backoff_max_secs = parse_or(&var, "BACKOFF_MAX_SECS", 300)?;

        let retry_kind = var("RETRY").map(|v| v.trim().to_ascii_lowercase());
        let retry = match retry_kind.as_deref() {
            None | Some("exponential") => RetryPolicy::Exponential(BackoffPolicy {
                base: Duration::from_millis(backoff_base_ms),
                max: Duration::from_secs(backoff_max_secs),
                ..BackoffPolicy::default()
            }),
            Some("fixed") => RetryPolicy::Fixed(Duration::from_millis(backoff_base_ms)),
            Some(other) => {
                bail!("{ENV_PREFIX}RETRY must be 'fixed' or 'exponential', got '{other}'")
            }
        };

        let download_timeout_secs = parse_or(&var, "DOWNLOAD_TIMEOUT_SECS", 600)?;
        let max_archive_bytes = parse_or(&var, "MAX_ARCHIVE_BYTES", 1024 * 1024 * 1024)?;
        let lock_stale_secs = parse_or(&var, "LOCK_STALE_SECS", 900)?;

        let log_level = var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            workload_id,
            control_plane_url,
            data_dir,
            reconcile_interval_secs,
            retry,
            download_timeout_secs,
            max_archive_bytes,
            lock_stale_secs,
            log_level,
        })
    }

    /// Per-workload directory under the data dir.
    pub fn workload_dir(&self) -> PathBuf {
        self.data_dir.join(self.workload_id.as_str())
    }

    pub fn state_path(&self) -> PathBuf {
        self.workload_dir().join("state.json")
    }

    pub fn charm_dir(&self) -> PathBuf {
        self.workload_dir().join("charm")
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            retry: self.retry.clone(),
        }
    }

    pub fn deployer_config(&self) -> DeployerConfig {
        DeployerConfig {
            root: self.charm_dir(),
            lock_stale_after: Duration::from_secs(self.lock_stale_secs),
        }
    }

    pub fn downloader_config(&self) -> HttpDownloaderConfig {
        HttpDownloaderConfig {
            archive_base_url: self.control_plane_url.clone(),
            timeout: Duration::from_secs(self.download_timeout_secs),
            max_archive_bytes: self.max_archive_bytes,
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {ENV_PREFIX}{name}: '{raw}'")),
        None => Ok(default),
    }
}
