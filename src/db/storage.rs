//! Storage collaborator used by the engine.

use chrono::NaiveDate;
use thiserror::Error;

use super::models::*;
use crate::validation::ValidationError;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Invalid record: {0}")]
    Invalid(#[from] ValidationError),
    #[error("Not found")]
    NotFound,
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<UnknownVariant> for StorageError {
    fn from(e: UnknownVariant) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}

/// Persistence operations the engine depends on.
///
/// Implementations must be safe to call from many probe tasks at once.
pub trait Storage: Send + Sync {
    fn list_active_targets(&self) -> Result<Vec<Target>, StorageError>;

    fn get_user(&self, user_id: UserId) -> Result<Option<User>, StorageError>;

    fn get_runtime_state(&self, target_id: TargetId) -> Result<Option<TargetRuntimeState>, StorageError>;

    fn save_runtime_state(&self, state: &TargetRuntimeState) -> Result<(), StorageError>;

    fn append_probe_result(&self, result: &ProbeResult) -> Result<(), StorageError>;

    fn get_uptime_record(
        &self,
        target_id: TargetId,
        date: NaiveDate,
    ) -> Result<Option<UptimeRecord>, StorageError>;

    fn upsert_uptime_record(&self, record: &UptimeRecord) -> Result<(), StorageError>;

    fn list_notification_settings(&self, user_id: UserId) -> Result<Vec<NotificationSetting>, StorageError>;

    /// Insert the event when `event.id == 0`, otherwise update it. Returns the id.
    fn save_notification_event(&self, event: &NotificationEvent) -> Result<i64, StorageError>;
}
