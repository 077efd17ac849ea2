//! plfm-vt Charm Agent Library
//!
//! The charm agent runs next to a managed workload and keeps the charm
//! (versioned application bundle) on disk in sync with what the control plane
//! wants deployed. It never leaves a partially applied charm behind: a new
//! version is downloaded, verified and unpacked into scratch space, then
//! swapped in atomically.
//!
//! ## Architecture
//!
//! ```text
//! CharmReconciler
//! ├── DesiredStateProvider   (control plane: which charm is wanted)
//! ├── LocalStateStore        (what this worker last deployed)
//! ├── CharmDeployer          (stage → deploy, deploy lock)
//! │   └── Downloader         (streaming, digest-checked fetch)
//! └── StatusPublisher        (best-effort status to the control plane)
//! ```
//!
//! ## Modules
//!
//! - `cancel`: Cancellation signal shared by every long-running operation
//! - `charm`: Download, unpack, staging and atomic deploy of charms
//! - `client`: Control plane HTTP client
//! - `config`: Environment configuration
//! - `reconciler`: Reconciliation loop and retry policy
//! - `state`: Crash-safe local deployment record
//! - `status`: Transition-only status reporting

pub mod cancel;
pub mod charm;
pub mod client;
pub mod config;
pub mod reconciler;
pub mod state;
pub mod status;

// Re-export commonly used types
pub use cancel::{CancelHandle, CancelSignal};
pub use charm::{CharmDeployer, DeploymentOutcome, DesiredSpec, StagingHandle, WorkloadId};
pub use client::ControlPlaneClient;
pub use reconciler::{CharmReconciler, DesiredStateProvider, ReconcileError, RetryPolicy};
pub use state::{LocalState, LocalStateStore};
pub use status::{StatusPhase, StatusPublisher, StatusSink};
