//! Controller module for ndb-operator.
//!
//! Contains the reconciliation loop, the per-tick sync state machine, the
//! workload controllers, error handling, status projection and spec
//! validation.

pub mod context;
pub mod error;
pub mod reconciler;
pub mod status;
pub mod sync;
pub mod sync_result;
pub mod validation;
pub mod workloads;
