//! Per-target in-flight flag release.

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::db::TargetId;

/// Sent to the scheduler loop when a probe task ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub target_id: TargetId,
    pub finished_at: Instant,
    /// Due again on the next tick instead of after a full interval.
    pub retry: bool,
}

/// Releases a target's in-flight flag when dropped.
///
/// Dropping without [`InFlightGuard::finish`] (task aborted or panicked)
/// still reports a completion, marked for retry.
pub struct InFlightGuard {
    target_id: TargetId,
    done: mpsc::UnboundedSender<Completion>,
    outcome: Option<(Instant, bool)>,
}

impl InFlightGuard {
    pub fn new(target_id: TargetId, done: mpsc::UnboundedSender<Completion>) -> Self {
        Self {
            target_id,
            done,
            outcome: None,
        }
    }

    pub fn finish(&mut self, finished_at: Instant, retry: bool) {
        self.outcome = Some((finished_at, retry));
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let (finished_at, retry) = self.outcome.unwrap_or_else(|| (Instant::now(), true));
        // The loop may already be gone during shutdown
        let _ = self.done.send(Completion {
            target_id: self.target_id,
            finished_at,
            retry,
        });
    }
}
