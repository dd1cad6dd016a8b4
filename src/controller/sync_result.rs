//! Verdicts returned by the steps of the sync loop.
//!
//! Every step either lets the tick fall through to the next step, ends the
//! tick, or ends it with a requeue after a delay. Errors travel separately
//! through `Result`, so a step signature is `Result<SyncResult, Error>` and
//! callers dispatch all four arms.

use std::time::Duration;

use crate::controller::error::Error;

/// Outcome of a single sync step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncResult {
    /// Fall through to the next step.
    Continue,
    /// The tick ended successfully; wait for the next change event.
    Finish,
    /// The tick ended; schedule another reconciliation after the delay.
    Requeue(Duration),
}

impl SyncResult {
    /// True when the remaining steps of the tick must not run.
    pub fn stops_sync(&self) -> bool {
        !matches!(self, SyncResult::Continue)
    }
}

/// Step result type: a verdict or an error.
pub type StepResult = std::result::Result<SyncResult, Error>;

/// The step is done and the sync can proceed.
pub fn continue_processing() -> StepResult {
    Ok(SyncResult::Continue)
}

/// The tick is complete; no requeue.
pub fn finish_processing() -> StepResult {
    Ok(SyncResult::Finish)
}

/// The tick is complete; reconcile again after the given number of seconds
/// (0 requeues immediately).
pub fn requeue_in_seconds(seconds: u64) -> StepResult {
    Ok(SyncResult::Requeue(Duration::from_secs(seconds)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_sync() {
        assert!(!continue_processing().unwrap().stops_sync());
        assert!(finish_processing().unwrap().stops_sync());
        assert!(requeue_in_seconds(5).unwrap().stops_sync());
    }

    #[test]
    fn test_requeue_delay() {
        let result = requeue_in_seconds(5).unwrap();
        assert_eq!(result, SyncResult::Requeue(Duration::from_secs(5)));
        assert_eq!(
            requeue_in_seconds(0).unwrap(),
            SyncResult::Requeue(Duration::ZERO)
        );
    }
}
