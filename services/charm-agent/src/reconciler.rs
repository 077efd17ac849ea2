//! Reconciliation loop for keeping the deployed charm in sync.
//!
//! The reconciler:
//! - Fetches the desired charm from the control plane
//! - Compares it against the locally recorded deployment
//! - Drives stage → deploy → persist when they diverge
//! - Reports coarse status for every outcome
//!
//! At most one stage/deploy cycle is in flight: each tick is awaited before
//! the next starts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelSignal;
use crate::charm::{
    CharmDeployer, ConflictReason, DeployError, DeploymentOutcome, DesiredSpec, WorkloadId,
};
use crate::state::{LocalState, LocalStateStore, StateStoreError};
use crate::status::{StatusPhase, StatusPublisher};

/// Source of the desired charm (the control plane in production).
#[async_trait]
pub trait DesiredStateProvider: Send + Sync {
    async fn desired_spec(&self, workload_id: &WorkloadId) -> anyhow::Result<DesiredSpec>;
}

/// Errors from a reconciliation tick.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The desired state could not be fetched. No deploy was attempted.
    #[error("failed to fetch desired charm: {0}")]
    Provider(#[source] anyhow::Error),

    /// A concurrent deploy got in the way. Local state is untouched.
    #[error("upgrade of {locator} conflicted: {reason}")]
    Conflict {
        locator: String,
        reason: ConflictReason,
    },

    #[error("reconciliation cancelled")]
    Cancelled,

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("local state error: {0}")]
    State(#[from] StateStoreError),
}

impl ReconcileError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a later tick can succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::State(StateStoreError::Invalid(_)) => false,
            Self::Deploy(e) => !e.is_cancelled(),
            Self::Provider(_) | Self::Conflict { .. } | Self::State(_) => true,
        }
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(max_ms);

        let jitter = if self.jitter > 0.0 {
            rand::rng().random_range(-1.0..=1.0) * delay * self.jitter
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).clamp(0.0, max_ms) as u64)
    }
}

/// How long to wait before the next tick after consecutive failures.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Always wait the same amount.
    Fixed(Duration),
    /// Double the wait on each consecutive failure, up to a cap.
    Exponential(BackoffPolicy),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential(BackoffPolicy::default())
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential(backoff) => backoff.delay(attempt),
        }
    }
}

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between ticks while healthy.
    pub reconcile_interval: Duration,

    /// Wait policy after failed ticks.
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Reconciler for one managed workload.
pub struct CharmReconciler {
    workload_id: WorkloadId,
    provider: Arc<dyn DesiredStateProvider>,
    deployer: CharmDeployer,
    store: LocalStateStore,
    status: StatusPublisher,
    cancel: CancelSignal,
    trigger: Arc<Notify>,
    config: ReconcilerConfig,
}

impl CharmReconciler {
    /// Create a new reconciler.
    pub fn new(
        workload_id: WorkloadId,
        provider: Arc<dyn DesiredStateProvider>,
        deployer: CharmDeployer,
        store: LocalStateStore,
        status: StatusPublisher,
        cancel: CancelSignal,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            workload_id,
            provider,
            deployer,
            store,
            status,
            cancel,
            trigger: Arc::new(Notify::new()),
            config,
        }
    }

    /// Handle that wakes the loop for an immediate tick.
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    pub fn deployer(&self) -> &CharmDeployer {
        &self.deployer
    }

    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    /// Run the reconciliation loop until cancelled.
    pub async fn run(&self) {
        info!(
            workload_id = %self.workload_id,
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting charm reconciliation loop"
        );

        if let Err(e) = self.deployer.recover() {
            warn!(error = %e, "Failed to clean up interrupted deploys");
        }

        let mut consecutive_failures = 0u32;
        loop {
            match self.reconcile_once().await {
                Ok(()) => consecutive_failures = 0,
                Err(ReconcileError::Cancelled) => break,
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if e.is_conflict() {
                        warn!(
                            error = %e,
                            consecutive_failures,
                            "Charm upgrade conflicted, will retry"
                        );
                    } else {
                        error!(
                            error = %e,
                            consecutive_failures,
                            retryable = e.is_retryable(),
                            "Reconciliation failed"
                        );
                    }
                }
            }

            let delay = self.next_delay(consecutive_failures);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for next reconciliation");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(workload_id = %self.workload_id, "Charm reconciler shutting down");
    }

    /// Fetch the desired state and converge to it.
    pub async fn reconcile_once(&self) -> Result<(), ReconcileError> {
        let desired = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ReconcileError::Cancelled),
            desired = self.provider.desired_spec(&self.workload_id) => desired,
        };

        match desired {
            Ok(desired) => self.ensure_desired_state(&desired).await,
            Err(e) => {
                self.status
                    .publish(StatusPhase::Error, "failed to fetch desired charm")
                    .await;
                Err(ReconcileError::Provider(e))
            }
        }
    }

    /// Converge the deployed charm to `desired`.
    ///
    /// Every failure other than cancellation leaves an error status behind.
    pub async fn ensure_desired_state(&self, desired: &DesiredSpec) -> Result<(), ReconcileError> {
        let result = self.converge(desired).await;
        if let Err(ReconcileError::State(e)) = &result {
            self.status
                .publish(StatusPhase::Error, format!("local state error: {e}"))
                .await;
        }
        result
    }

    async fn converge(&self, desired: &DesiredSpec) -> Result<(), ReconcileError> {
        let local = self.store.load()?;

        if local.deployed_locator.as_deref() == Some(desired.locator.as_str()) {
            if local.deployed_modification_generation != desired.modification_generation {
                self.store.save(&LocalState {
                    deployed_locator: local.deployed_locator,
                    deployed_modification_generation: desired.modification_generation,
                })?;
                debug!(
                    locator = %desired.locator,
                    generation = desired.modification_generation,
                    "Charm unchanged, recorded new modification generation"
                );
            } else {
                debug!(locator = %desired.locator, "Charm already deployed");
            }
            return Ok(());
        }

        if self.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        info!(
            from = ?local.deployed_locator,
            to = %desired.locator,
            generation = desired.modification_generation,
            "Charm diverged from desired state"
        );
        self.status
            .publish(
                StatusPhase::Maintenance,
                format!("downloading charm ({})", desired.locator),
            )
            .await;

        match self
            .deployer
            .run_cycle(&desired.descriptor(), &self.cancel)
            .await
        {
            DeploymentOutcome::Deployed => {
                self.store.save(&LocalState {
                    deployed_locator: Some(desired.locator.clone()),
                    deployed_modification_generation: desired.modification_generation,
                })?;
                self.status.publish(StatusPhase::Active, "").await;
                Ok(())
            }
            DeploymentOutcome::Conflict(reason) => {
                self.status
                    .publish(StatusPhase::Error, "upgrade failed")
                    .await;
                Err(ReconcileError::Conflict {
                    locator: desired.locator.clone(),
                    reason,
                })
            }
            DeploymentOutcome::Cancelled => Err(ReconcileError::Cancelled),
            DeploymentOutcome::Failed(e) => {
                let detail = match e.digest_mismatch() {
                    Some((expected, actual)) => {
                        format!("charm digest mismatch (expected {expected}, got {actual})")
                    }
                    None => format!("charm deploy failed: {e}"),
                };
                self.status.publish(StatusPhase::Error, detail).await;
                Err(ReconcileError::Deploy(e))
            }
        }
    }

    fn next_delay(&self, consecutive_failures: u32) -> Duration {
        match consecutive_failures {
            0 => self.config.reconcile_interval,
            n => self.config.retry.delay(n - 1),
        }
    }
}
