//! Status tracker: the per-target up/down state machine.
//!
//! Each target has its own slot in a keyed lock map, so updates for one
//! target are serialized while different targets proceed in parallel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::db::{
    MonitorStatus, ProbeFailure, ProbeResult, Storage, StorageError, Target, TargetId, TargetRuntimeState, UserId,
};

/// A change of `current_status` for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub target_id: TargetId,
    pub user_id: UserId,
    pub target_name: String,
    pub url: String,
    pub from: MonitorStatus,
    pub to: MonitorStatus,
    pub at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub failure: Option<ProbeFailure>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<f64>,
}

/// Outcome of applying one result.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub previous: MonitorStatus,
    pub state: TargetRuntimeState,
    pub transition: Option<TransitionEvent>,
}

/// Compute the state that follows `state` once `result` is observed.
///
/// Successes reset the failure run and mark the target UP. Failures extend
/// the run and mark it DOWN once `failure_threshold` is reached; below the
/// threshold an UNKNOWN target becomes PENDING and any other keeps its status.
pub fn advance(state: &TargetRuntimeState, result: &ProbeResult, failure_threshold: u32) -> TargetRuntimeState {
    let mut next = state.clone();
    next.last_check_at = Some(result.checked_at);

    if result.is_success() {
        next.consecutive_failures = 0;
        next.current_status = MonitorStatus::Up;
    } else {
        next.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if next.consecutive_failures >= failure_threshold.max(1) {
            next.current_status = MonitorStatus::Down;
        } else if state.current_status == MonitorStatus::Unknown {
            next.current_status = MonitorStatus::Pending;
        }
    }

    if next.current_status != state.current_status {
        next.last_status_change_at = Some(result.checked_at);
    }
    next
}

type Slot = Arc<Mutex<Option<TargetRuntimeState>>>;

/// Single writer of [`TargetRuntimeState`].
pub struct StatusTracker {
    storage: Arc<dyn Storage>,
    failure_threshold: u32,
    slots: Mutex<HashMap<TargetId, Slot>>,
}

impl StatusTracker {
    pub fn new(storage: Arc<dyn Storage>, failure_threshold: u32) -> Self {
        Self {
            storage,
            failure_threshold: failure_threshold.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, target_id: TargetId) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(target_id).or_default().clone()
    }

    /// Apply a result to its target's state and persist it.
    ///
    /// Returns `None` when the result is older than the last applied one.
    pub fn apply(&self, target: &Target, result: &ProbeResult) -> Result<Option<StatusUpdate>, StorageError> {
        let slot = self.slot(target.id);
        let mut guard = lock(&slot);

        let current = match guard.as_ref() {
            Some(state) => state.clone(),
            None => self
                .storage
                .get_runtime_state(target.id)?
                .unwrap_or_else(|| TargetRuntimeState::new(target.id)),
        };

        if current.last_check_at.is_some_and(|last| result.checked_at < last) {
            tracing::warn!(
                "Tracker: dropping out-of-order result for {} ({} < {:?})",
                target.name,
                result.checked_at,
                current.last_check_at
            );
            *guard = Some(current);
            return Ok(None);
        }

        let next = advance(&current, result, self.failure_threshold);
        self.storage.save_runtime_state(&next)?;

        let transition = (next.current_status != current.current_status).then(|| TransitionEvent {
            target_id: target.id,
            user_id: target.user_id,
            target_name: target.name.clone(),
            url: target.url.clone(),
            from: current.current_status,
            to: next.current_status,
            at: result.checked_at,
            consecutive_failures: next.consecutive_failures,
            failure: result.failure,
            error_message: result.error_message.clone(),
            response_time_ms: result.response_time_ms,
        });

        if let Some(t) = &transition {
            tracing::info!("Tracker: {} changed {} -> {}", target.name, t.from, t.to);
        }

        *guard = Some(next.clone());
        Ok(Some(StatusUpdate {
            previous: current.current_status,
            state: next,
            transition,
        }))
    }

    /// Last applied state, if the target has been seen.
    pub fn snapshot(&self, target_id: TargetId) -> Option<TargetRuntimeState> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(&target_id)?.clone();
        drop(slots);
        let state = lock(&slot).clone();
        state
    }

    /// Drop the slot of a target that is no longer scheduled.
    pub fn evict(&self, target_id: TargetId) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(&target_id);
    }

    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<TargetRuntimeState>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
