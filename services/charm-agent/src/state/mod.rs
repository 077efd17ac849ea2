//! Local state persistence for the charm agent.
//!
//! Records the last charm this worker deployed and the modification
//! generation it was deployed at, so the reconciler stays idempotent across
//! restarts.

mod store;

pub use store::{LocalState, LocalStateStore, StateStoreError};
