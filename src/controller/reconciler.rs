//! Reconciliation entry points for the NdbCluster controller.
//!
//! Wires the per-tick [`SyncContext`](crate::controller::sync::SyncContext)
//! into the kube-runtime controller: verdicts map onto requeue actions and
//! errors are classified for the retry policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::controller::sync::SyncContext;
use crate::controller::sync_result::SyncResult;
use crate::crd::NdbCluster;

/// A tick running longer than this is considered stuck.
const STUCK_TICK_THRESHOLD: Duration = Duration::from_secs(300);

/// Reconcile an NdbCluster.
///
/// One call runs a single tick of the sync state machine; a full sync of a
/// config change spreads over many ticks.
pub async fn reconcile(obj: Arc<NdbCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling NdbCluster");

    if obj.metadata.deletion_timestamp.is_some() {
        // Owned resources cascade through their owner references.
        debug!(name = %name, "NdbCluster is being deleted, nothing to do");
        return Ok(Action::await_change());
    }

    let result = SyncContext::new(&ctx, &obj).sync().await;

    let elapsed = start_time.elapsed();
    if elapsed > STUCK_TICK_THRESHOLD {
        warn!(
            name = %name,
            elapsed_secs = elapsed.as_secs(),
            "Reconciliation tick ran far longer than expected"
        );
    }
    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_tick(&namespace, &name, elapsed.as_secs_f64());
        health_state.mark_tick();
    }

    match result? {
        SyncResult::Finish => {
            info!(name = %name, "Sync finished");
            Ok(Action::await_change())
        }
        SyncResult::Requeue(delay) => {
            debug!(name = %name, delay_secs = delay.as_secs(), "Sync requeued");
            Ok(Action::requeue(delay))
        }
        // A tick never ends on a fall-through verdict; treat it as done.
        SyncResult::Continue => Ok(Action::await_change()),
    }
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<NdbCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(error.requeue_after())
    }
}
