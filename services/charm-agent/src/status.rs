//! Workload status reporting.
//!
//! Status is observability only. [`StatusPublisher`] never lets a sink
//! failure reach the reconciliation decision. Progress statuses are only
//! forwarded on transitions; errors are forwarded on every failed tick so
//! the control plane always holds the latest failure.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Coarse lifecycle phase of the managed workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Maintenance,
    Error,
    Active,
}

impl StatusPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maintenance => "maintenance",
            Self::Error => "error",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for StatusPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for status updates (the control plane in production).
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn set_status(&self, phase: StatusPhase, detail: &str) -> anyhow::Result<()>;
}

/// Best-effort status reporting.
pub struct StatusPublisher {
    sink: Arc<dyn StatusSink>,
    last_published: Mutex<Option<(StatusPhase, String)>>,
}

impl StatusPublisher {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            sink,
            last_published: Mutex::new(None),
        }
    }

    /// Publish a status. Returns whether the sink accepted it.
    ///
    /// A non-error status identical to the last accepted one is not sent
    /// again and counts as accepted. Errors are always sent.
    pub async fn publish(&self, phase: StatusPhase, detail: impl Into<String>) -> bool {
        let detail = detail.into();
        let mut last = self.last_published.lock().await;

        if phase != StatusPhase::Error
            && last
                .as_ref()
                .is_some_and(|(p, d)| *p == phase && *d == detail)
        {
            debug!(phase = %phase, detail = %detail, "Status unchanged, not reporting");
            return true;
        }

        match self.sink.set_status(phase, &detail).await {
            Ok(()) => {
                debug!(phase = %phase, detail = %detail, "Status reported");
                *last = Some((phase, detail));
                true
            }
            Err(e) => {
                warn!(phase = %phase, detail = %detail, error = %e, "Failed to report status");
                false
            }
        }
    }

    /// The last status the sink accepted.
    pub async fn last_published(&self) -> Option<(StatusPhase, String)> {
        self.last_published.lock().await.clone()
    }
}
