//! Aggregator: rolls probe results up into daily uptime records.

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::db::{average, percentage, ProbeResult, Storage, StorageError, Target, TargetId, UptimeRecord, UptimeStats};

/// Results kept per target when counting them failed to persist.
const MAX_UNCOUNTED: usize = 1024;

/// The current day's record of one target, plus the results already counted into it.
struct OpenDay {
    record: UptimeRecord,
    seen: HashSet<Uuid>,
}

pub struct Aggregator {
    storage: Arc<dyn Storage>,
    open: Mutex<HashMap<TargetId, OpenDay>>,
    uncounted: Mutex<HashMap<TargetId, Vec<ProbeResult>>>,
}

impl Aggregator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            open: Mutex::new(HashMap::new()),
            uncounted: Mutex::new(HashMap::new()),
        }
    }

    fn open(&self) -> MutexGuard<'_, HashMap<TargetId, OpenDay>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn uncounted(&self) -> MutexGuard<'_, HashMap<TargetId, Vec<ProbeResult>>> {
        self.uncounted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one result into its day's record.
    ///
    /// Returns the updated record, or `None` when the result was a duplicate or
    /// belongs to a day that is already sealed. A result whose count could not
    /// be stored is kept and counted again ahead of the target's next result.
    pub fn record(&self, target: &Target, result: &ProbeResult) -> Result<Option<UptimeRecord>, StorageError> {
        let mut queue = self.uncounted().remove(&target.id).unwrap_or_default();
        queue.push(result.clone());

        let mut latest = None;
        let mut queue = queue.into_iter();
        while let Some(next) = queue.next() {
            match self.count_result(target, &next) {
                Ok(record) => latest = record,
                Err(e) => {
                    self.keep_uncounted(target.id, std::iter::once(next).chain(queue));
                    return Err(e);
                }
            }
        }
        Ok(latest)
    }

    fn keep_uncounted(&self, target_id: TargetId, results: impl IntoIterator<Item = ProbeResult>) {
        let mut uncounted = self.uncounted();
        let backlog = uncounted.entry(target_id).or_default();
        backlog.extend(results);
        if backlog.len() > MAX_UNCOUNTED {
            let excess = backlog.len() - MAX_UNCOUNTED;
            tracing::warn!("Aggregator: dropping {} uncounted results for target {}", excess, target_id);
            backlog.drain(..excess);
        }
    }

    fn count_result(&self, target: &Target, result: &ProbeResult) -> Result<Option<UptimeRecord>, StorageError> {
        let day = result.checked_at.date_naive();
        let mut open = self.open();

        let open_date = open.get(&target.id).map(|o| o.record.date);
        match open_date {
            Some(date) if date == day => {}
            Some(date) if date > day => {
                tracing::warn!(
                    "Aggregator: dropping result for {} on sealed day {} (open day {})",
                    target.name,
                    day,
                    date
                );
                return Ok(None);
            }
            Some(_) => {
                if let Some(previous) = open.remove(&target.id) {
                    self.seal(previous.record)?;
                }
                match self.load_day(target, day)? {
                    Some(record) => open.insert(target.id, OpenDay { record, seen: HashSet::new() }),
                    None => return Ok(None),
                };
            }
            None => {
                self.seal_stored(target.id, day.pred_opt())?;
                match self.load_day(target, day)? {
                    Some(record) => open.insert(target.id, OpenDay { record, seen: HashSet::new() }),
                    None => return Ok(None),
                };
            }
        }

        let Some(entry) = open.get_mut(&target.id) else {
            return Ok(None);
        };
        if entry.seen.contains(&result.id) {
            tracing::debug!("Aggregator: result {} already counted", result.id);
            return Ok(None);
        }

        let mut next = entry.record.clone();
        count(&mut next, target, result);
        self.storage.upsert_uptime_record(&next)?;

        entry.seen.insert(result.id);
        entry.record = next.clone();
        Ok(Some(next))
    }

    /// Load the stored record for `day`, or start a fresh one. `None` if the day is sealed.
    fn load_day(&self, target: &Target, day: NaiveDate) -> Result<Option<UptimeRecord>, StorageError> {
        match self.storage.get_uptime_record(target.id, day)? {
            Some(record) if record.sealed => {
                tracing::warn!("Aggregator: dropping result for {} on sealed day {}", target.name, day);
                Ok(None)
            }
            Some(record) => Ok(Some(record)),
            None => Ok(Some(UptimeRecord::new(target.id, day))),
        }
    }

    fn seal(&self, mut record: UptimeRecord) -> Result<(), StorageError> {
        record.sealed = true;
        self.storage.upsert_uptime_record(&record)?;
        tracing::debug!(
            "Aggregator: sealed {} for target {} at {:.2}%",
            record.date,
            record.target_id,
            record.uptime_percentage()
        );
        Ok(())
    }

    /// Seal a stored record left open by a previous run.
    fn seal_stored(&self, target_id: TargetId, day: Option<NaiveDate>) -> Result<(), StorageError> {
        let Some(day) = day else {
            return Ok(());
        };
        match self.storage.get_uptime_record(target_id, day)? {
            Some(record) if !record.sealed => self.seal(record),
            _ => Ok(()),
        }
    }

    /// Seal every open record whose day is before `today`. Returns how many were sealed.
    pub fn seal_stale(&self, today: NaiveDate) -> Result<usize, StorageError> {
        let mut open = self.open();
        let stale: Vec<TargetId> = open
            .iter()
            .filter(|(_, o)| o.record.date < today)
            .map(|(id, _)| *id)
            .collect();

        for target_id in &stale {
            if let Some(day) = open.get(target_id) {
                self.seal(day.record.clone())?;
            }
            open.remove(target_id);
        }
        Ok(stale.len())
    }

    /// Forget the open day of a target that is no longer scheduled.
    pub fn evict(&self, target_id: TargetId) {
        self.open().remove(&target_id);
        self.uncounted().remove(&target_id);
    }

    pub fn current(&self, target_id: TargetId) -> Option<UptimeRecord> {
        self.open().get(&target_id).map(|o| o.record.clone())
    }
}

fn count(record: &mut UptimeRecord, target: &Target, result: &ProbeResult) {
    record.total_checks += 1;
    if result.is_success() {
        record.successful_checks += 1;
    } else {
        record.failed_checks += 1;
        record.downtime_seconds += u64::from(target.check_interval_seconds);
    }
    if let Some(ms) = result.response_time_ms {
        record.latency_sum_ms += ms;
        record.latency_samples += 1;
    }
}

/// Combine daily records into one summary. `None` for an empty slice.
pub fn summarize(records: &[UptimeRecord]) -> Option<UptimeStats> {
    let period_start = records.iter().map(|r| r.date).min()?;
    let period_end = records.iter().map(|r| r.date).max()?;

    let total: u64 = records.iter().map(|r| r.total_checks).sum();
    let successful: u64 = records.iter().map(|r| r.successful_checks).sum();
    let failed: u64 = records.iter().map(|r| r.failed_checks).sum();
    let latency_sum: f64 = records.iter().map(|r| r.latency_sum_ms).sum();
    let samples: u64 = records.iter().map(|r| r.latency_samples).sum();

    Some(UptimeStats {
        uptime_percentage: percentage(successful, total),
        total_checks: total,
        successful_checks: successful,
        failed_checks: failed,
        average_response_time_ms: average(latency_sum, samples),
        downtime_seconds: records.iter().map(|r| r.downtime_seconds).sum(),
        period_start,
        period_end,
    })
}
