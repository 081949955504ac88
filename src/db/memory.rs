//! In-process storage, for embedding the engine without a database and for tests.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::models::*;
use super::storage::{Storage, StorageError};

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    targets: HashMap<TargetId, Target>,
    states: HashMap<TargetId, TargetRuntimeState>,
    results: Vec<ProbeResult>,
    uptime: HashMap<(TargetId, NaiveDate), UptimeRecord>,
    settings: Vec<NotificationSetting>,
    events: Vec<NotificationEvent>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Storage backed by hash maps behind a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, mut user: User) -> User {
        let mut tables = self.tables();
        if user.id == 0 {
            user.id = tables.next_id();
        }
        tables.users.insert(user.id, user.clone());
        user
    }

    /// Insert or replace a target, assigning an id when it has none.
    pub fn put_target(&self, mut target: Target) -> Target {
        let mut tables = self.tables();
        if target.id == 0 {
            target.id = tables.next_id();
        }
        tables.targets.insert(target.id, target.clone());
        target
    }

    pub fn add_notification_setting(&self, mut setting: NotificationSetting) -> NotificationSetting {
        let mut tables = self.tables();
        if setting.id == 0 {
            setting.id = tables.next_id();
        }
        tables.settings.push(setting.clone());
        setting
    }

    pub fn probe_results(&self, target_id: TargetId) -> Vec<ProbeResult> {
        self.tables()
            .results
            .iter()
            .filter(|r| r.target_id == target_id)
            .cloned()
            .collect()
    }

    pub fn notification_events(&self) -> Vec<NotificationEvent> {
        self.tables().events.clone()
    }
}

impl Storage for MemoryStore {
    fn list_active_targets(&self) -> Result<Vec<Target>, StorageError> {
        let mut targets: Vec<Target> = self
            .tables()
            .targets
            .values()
            .filter(|t| t.is_active)
            .cloned()
            .collect();
        targets.sort_by_key(|t| t.id);
        Ok(targets)
    }

    fn get_user(&self, user_id: UserId) -> Result<Option<User>, StorageError> {
        Ok(self.tables().users.get(&user_id).cloned())
    }

    fn get_runtime_state(&self, target_id: TargetId) -> Result<Option<TargetRuntimeState>, StorageError> {
        Ok(self.tables().states.get(&target_id).cloned())
    }

    fn save_runtime_state(&self, state: &TargetRuntimeState) -> Result<(), StorageError> {
        self.tables().states.insert(state.target_id, state.clone());
        Ok(())
    }

    fn append_probe_result(&self, result: &ProbeResult) -> Result<(), StorageError> {
        self.tables().results.push(result.clone());
        Ok(())
    }

    fn get_uptime_record(
        &self,
        target_id: TargetId,
        date: NaiveDate,
    ) -> Result<Option<UptimeRecord>, StorageError> {
        Ok(self.tables().uptime.get(&(target_id, date)).cloned())
    }

    fn upsert_uptime_record(&self, record: &UptimeRecord) -> Result<(), StorageError> {
        let mut tables = self.tables();
        let key = (record.target_id, record.date);
        if tables.uptime.get(&key).is_some_and(|existing| existing.sealed) {
            return Ok(());
        }
        tables.uptime.insert(key, record.clone());
        Ok(())
    }

    fn list_notification_settings(&self, user_id: UserId) -> Result<Vec<NotificationSetting>, StorageError> {
        Ok(self
            .tables()
            .settings
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    fn save_notification_event(&self, event: &NotificationEvent) -> Result<i64, StorageError> {
        let mut tables = self.tables();
        if event.id == 0 {
            let mut stored = event.clone();
            stored.id = tables.next_id();
            let id = stored.id;
            tables.events.push(stored);
            return Ok(id);
        }

        let existing = tables
            .events
            .iter_mut()
            .find(|e| e.id == event.id)
            .ok_or(StorageError::NotFound)?;
        *existing = event.clone();
        Ok(event.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_active_targets_are_listed() {
        let store = MemoryStore::new();
        let active = store.put_target(Target {
            name: "a".to_string(),
            ..Default::default()
        });
        store.put_target(Target {
            name: "b".to_string(),
            is_active: false,
            ..Default::default()
        });

        let listed = store.list_active_targets().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
    }

    #[test]
    fn test_sealed_record_is_immutable() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut record = UptimeRecord::new(1, day);
        record.total_checks = 1;
        record.sealed = true;
        store.upsert_uptime_record(&record).unwrap();

        let mut changed = record.clone();
        changed.total_checks = 5;
        store.upsert_uptime_record(&changed).unwrap();

        assert_eq!(store.get_uptime_record(1, day).unwrap(), Some(record));
    }
}
