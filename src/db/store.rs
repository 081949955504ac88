//! SQLite database store implementation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;
use super::storage::{Storage, StorageError};
use crate::validation::{revalidate, validate_notification_setting};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DATE_FORMAT: &str = "%Y-%m-%d";

const TARGET_COLUMNS: &str = "id, user_id, name, url, monitor_type, method, check_interval_seconds, timeout_seconds, \
     expected_status_code, expected_content, custom_headers, tags, is_active, created_at, updated_at";

const RESULT_COLUMNS: &str = "id, target_id, status, response_time_ms, status_code, error_message, failure, \
     response_headers, response_body_sample, checked_at";

const UPTIME_COLUMNS: &str = "target_id, date, total_checks, successful_checks, failed_checks, latency_sum_ms, \
     latency_samples, downtime_seconds, sealed";

const SETTING_COLUMNS: &str =
    "id, user_id, notification_type, method, is_enabled, threshold_minutes, webhook_url, custom_template";

const EVENT_COLUMNS: &str = "id, user_id, target_id, notification_type, method, title, message, delivery_status, \
     error_message, metadata, sent_at, is_read, created_at";

#[derive(Error, Debug)]
#[error("unparseable value: {0}")]
struct BadValue(String);

/// Thread-safe SQLite store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StorageError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Users ---

    /// Add a new user and return its ID.
    pub fn add_user(&self, user: &mut User) -> Result<UserId, StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (username, email, full_name, is_active, email_notifications_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.username,
                user.email,
                user.full_name,
                user.is_active,
                user.email_notifications_enabled,
                format_db_time(&user.created_at),
            ],
        )?;
        user.id = conn.last_insert_rowid();
        Ok(user.id)
    }

    // --- Targets ---

    /// Validate and add a new target, storing its canonical form. Returns the ID.
    pub fn add_target(&self, target: &mut Target) -> Result<TargetId, StorageError> {
        *target = revalidate(target)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO targets (user_id, name, url, monitor_type, method, check_interval_seconds, timeout_seconds,
                 expected_status_code, expected_content, custom_headers, tags, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                target.user_id,
                target.name,
                target.url,
                target.monitor_type.as_str(),
                target.method.as_str(),
                target.check_interval_seconds,
                target.timeout_seconds,
                target.expected_status_code,
                target.expected_content,
                serde_json::to_string(&target.custom_headers)?,
                serde_json::to_string(&target.tags)?,
                target.is_active,
                format_db_time(&target.created_at),
                format_db_time(&target.updated_at),
            ],
        )?;
        target.id = conn.last_insert_rowid();
        Ok(target.id)
    }

    /// Validate and update an existing target.
    pub fn update_target(&self, target: &Target) -> Result<(), StorageError> {
        let target = revalidate(target)?;
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE targets SET name=?1, url=?2, monitor_type=?3, method=?4, check_interval_seconds=?5,
                 timeout_seconds=?6, expected_status_code=?7, expected_content=?8, custom_headers=?9, tags=?10,
                 is_active=?11, updated_at=?12
             WHERE id=?13",
            params![
                target.name,
                target.url,
                target.monitor_type.as_str(),
                target.method.as_str(),
                target.check_interval_seconds,
                target.timeout_seconds,
                target.expected_status_code,
                target.expected_content,
                serde_json::to_string(&target.custom_headers)?,
                serde_json::to_string(&target.tags)?,
                target.is_active,
                format_db_time(&target.updated_at),
                target.id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: TargetId) -> Result<Target, StorageError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1"),
            params![id],
            target_from_row,
        )
        .optional()?
        .ok_or(StorageError::NotFound)
    }

    /// Delete a target and everything recorded about it.
    pub fn delete_target(&self, id: TargetId) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Notification settings ---

    /// Add a notification setting and return its ID.
    pub fn add_notification_setting(&self, setting: &mut NotificationSetting) -> Result<SettingId, StorageError> {
        validate_notification_setting(setting)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO notification_settings (user_id, notification_type, method, is_enabled, threshold_minutes,
                 webhook_url, custom_template)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                setting.user_id,
                setting.notification_type.as_str(),
                setting.method.as_str(),
                setting.is_enabled,
                setting.threshold_minutes,
                setting.webhook_url,
                setting.custom_template,
            ],
        )?;
        setting.id = conn.last_insert_rowid();
        Ok(setting.id)
    }

    // --- Read views ---

    /// Most recent probe results for a target, newest first.
    pub fn list_probe_results(&self, target_id: TargetId, limit: u32) -> Result<Vec<ProbeResult>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM probe_results WHERE target_id = ?1 ORDER BY checked_at DESC LIMIT ?2"
        ))?;
        let results = stmt
            .query_map(params![target_id, limit], result_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// Daily records for a target within `[start, end]`.
    pub fn list_uptime_records(
        &self,
        target_id: TargetId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UptimeRecord>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UPTIME_COLUMNS} FROM uptime_records
             WHERE target_id = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date ASC"
        ))?;
        let records = stmt
            .query_map(
                params![
                    target_id,
                    start.format(DATE_FORMAT).to_string(),
                    end.format(DATE_FORMAT).to_string(),
                ],
                uptime_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Summary of a user's targets: status counts, plus checks and uptime since `since`.
    pub fn monitoring_summary(&self, user_id: UserId, since: DateTime<Utc>) -> Result<MonitoringSummary, StorageError> {
        let conn = self.conn();

        let (total, active, up, down): (i64, i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(t.is_active), 0),
                 COALESCE(SUM(CASE WHEN t.is_active = 1 AND s.current_status = 'up' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN t.is_active = 1 AND s.current_status = 'down' THEN 1 ELSE 0 END), 0)
             FROM targets t LEFT JOIN runtime_states s ON s.target_id = t.id
             WHERE t.user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let (recent, latency_sum, latency_samples): (i64, f64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(r.response_time_ms), 0.0), COUNT(r.response_time_ms)
             FROM probe_results r JOIN targets t ON t.id = r.target_id
             WHERE t.user_id = ?1 AND r.checked_at >= ?2",
            params![user_id, format_db_time(&since)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let (successful, checks): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(u.successful_checks), 0), COALESCE(SUM(u.total_checks), 0)
             FROM uptime_records u JOIN targets t ON t.id = u.target_id
             WHERE t.user_id = ?1 AND u.date >= ?2",
            params![user_id, since.date_naive().format(DATE_FORMAT).to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(MonitoringSummary {
            total_items: total as u64,
            active_items: active as u64,
            up_items: up as u64,
            down_items: down as u64,
            unknown_items: (active - up - down).max(0) as u64,
            recent_checks: recent as u64,
            average_response_time_ms: average(latency_sum, latency_samples as u64),
            overall_uptime_percentage: percentage(successful as u64, checks as u64),
        })
    }

    /// Notification events for a user, newest first.
    pub fn list_notification_events(&self, user_id: UserId) -> Result<Vec<NotificationEvent>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM notification_events WHERE user_id = ?1 ORDER BY created_at DESC, id DESC"
        ))?;
        let events = stmt
            .query_map(params![user_id], event_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }
}

impl Storage for Store {
    fn list_active_targets(&self) -> Result<Vec<Target>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {TARGET_COLUMNS} FROM targets WHERE is_active = 1"))?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    fn get_user(&self, user_id: UserId) -> Result<Option<User>, StorageError> {
        let conn = self.conn();
        let user = conn
            .query_row(
                "SELECT id, username, email, full_name, is_active, email_notifications_enabled, created_at
                 FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        full_name: row.get(3)?,
                        is_active: row.get(4)?,
                        email_notifications_enabled: row.get(5)?,
                        created_at: get_time(row, 6)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn get_runtime_state(&self, target_id: TargetId) -> Result<Option<TargetRuntimeState>, StorageError> {
        let conn = self.conn();
        let state = conn
            .query_row(
                "SELECT target_id, current_status, consecutive_failures, last_check_at, last_status_change_at
                 FROM runtime_states WHERE target_id = ?1",
                params![target_id],
                |row| {
                    Ok(TargetRuntimeState {
                        target_id: row.get(0)?,
                        current_status: get_enum(row, 1)?,
                        consecutive_failures: row.get(2)?,
                        last_check_at: get_opt_time(row, 3)?,
                        last_status_change_at: get_opt_time(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    fn save_runtime_state(&self, state: &TargetRuntimeState) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runtime_states (target_id, current_status, consecutive_failures, last_check_at, last_status_change_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(target_id) DO UPDATE SET
             current_status=excluded.current_status, consecutive_failures=excluded.consecutive_failures,
             last_check_at=excluded.last_check_at, last_status_change_at=excluded.last_status_change_at",
            params![
                state.target_id,
                state.current_status.as_str(),
                state.consecutive_failures,
                state.last_check_at.as_ref().map(format_db_time),
                state.last_status_change_at.as_ref().map(format_db_time),
            ],
        )?;
        Ok(())
    }

    fn append_probe_result(&self, result: &ProbeResult) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute(
            &format!("INSERT INTO probe_results ({RESULT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                result.id.to_string(),
                result.target_id,
                result.status.as_str(),
                result.response_time_ms,
                result.status_code,
                result.error_message,
                result.failure.map(|f| f.as_str()),
                serde_json::to_string(&result.response_headers)?,
                result.response_body_sample,
                format_db_time(&result.checked_at),
            ],
        )?;
        Ok(())
    }

    fn get_uptime_record(
        &self,
        target_id: TargetId,
        date: NaiveDate,
    ) -> Result<Option<UptimeRecord>, StorageError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {UPTIME_COLUMNS} FROM uptime_records WHERE target_id = ?1 AND date = ?2"),
                params![target_id, date.format(DATE_FORMAT).to_string()],
                uptime_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_uptime_record(&self, record: &UptimeRecord) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO uptime_records (target_id, date, total_checks, successful_checks, failed_checks,
                 latency_sum_ms, latency_samples, average_response_time_ms, uptime_percentage, downtime_seconds, sealed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(target_id, date) DO UPDATE SET
             total_checks=excluded.total_checks, successful_checks=excluded.successful_checks,
             failed_checks=excluded.failed_checks, latency_sum_ms=excluded.latency_sum_ms,
             latency_samples=excluded.latency_samples, average_response_time_ms=excluded.average_response_time_ms,
             uptime_percentage=excluded.uptime_percentage, downtime_seconds=excluded.downtime_seconds,
             sealed=excluded.sealed
             WHERE uptime_records.sealed = 0",
            params![
                record.target_id,
                record.date.format(DATE_FORMAT).to_string(),
                record.total_checks as i64,
                record.successful_checks as i64,
                record.failed_checks as i64,
                record.latency_sum_ms,
                record.latency_samples as i64,
                record.average_response_time_ms(),
                record.uptime_percentage(),
                record.downtime_seconds as i64,
                record.sealed,
            ],
        )?;
        Ok(())
    }

    fn list_notification_settings(&self, user_id: UserId) -> Result<Vec<NotificationSetting>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SETTING_COLUMNS} FROM notification_settings WHERE user_id = ?1 ORDER BY id ASC"
        ))?;
        let settings = stmt
            .query_map(params![user_id], |row| {
                Ok(NotificationSetting {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    notification_type: get_enum(row, 2)?,
                    method: get_enum(row, 3)?,
                    is_enabled: row.get(4)?,
                    threshold_minutes: row.get(5)?,
                    webhook_url: row.get(6)?,
                    custom_template: row.get(7)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(settings)
    }

    fn save_notification_event(&self, event: &NotificationEvent) -> Result<i64, StorageError> {
        let conn = self.conn();
        let metadata = serde_json::to_string(&event.metadata)?;

        if event.id == 0 {
            conn.execute(
                "INSERT INTO notification_events (user_id, target_id, notification_type, method, title, message,
                     delivery_status, error_message, metadata, sent_at, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    event.user_id,
                    event.target_id,
                    event.notification_type.as_str(),
                    event.method.as_str(),
                    event.title,
                    event.message,
                    event.delivery_status.as_str(),
                    event.error_message,
                    metadata,
                    event.sent_at.as_ref().map(format_db_time),
                    event.is_read,
                    format_db_time(&event.created_at),
                ],
            )?;
            return Ok(conn.last_insert_rowid());
        }

        let changed = conn.execute(
            "UPDATE notification_events SET delivery_status=?1, error_message=?2, sent_at=?3, is_read=?4, metadata=?5
             WHERE id=?6",
            params![
                event.delivery_status.as_str(),
                event.error_message,
                event.sent_at.as_ref().map(format_db_time),
                event.is_read,
                metadata,
                event.id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(event.id)
    }
}

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    Ok(Target {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        monitor_type: get_enum(row, 4)?,
        method: get_enum(row, 5)?,
        check_interval_seconds: row.get(6)?,
        timeout_seconds: row.get(7)?,
        expected_status_code: row.get(8)?,
        expected_content: row.get(9)?,
        custom_headers: get_json(row, 10)?,
        tags: get_json(row, 11)?,
        is_active: row.get(12)?,
        created_at: get_time(row, 13)?,
        updated_at: get_time(row, 14)?,
    })
}

fn result_from_row(row: &Row<'_>) -> SqlResult<ProbeResult> {
    let id: String = row.get(0)?;
    let failure: Option<String> = row.get(6)?;
    Ok(ProbeResult {
        id: id.parse().map_err(|e| conversion_error(0, e))?,
        target_id: row.get(1)?,
        status: get_enum(row, 2)?,
        response_time_ms: row.get(3)?,
        status_code: row.get(4)?,
        error_message: row.get(5)?,
        failure: failure
            .map(|f| f.parse::<ProbeFailure>())
            .transpose()
            .map_err(|e| conversion_error(6, e))?,
        response_headers: get_json(row, 7)?,
        response_body_sample: row.get(8)?,
        checked_at: get_time(row, 9)?,
    })
}

fn uptime_from_row(row: &Row<'_>) -> SqlResult<UptimeRecord> {
    let date: String = row.get(1)?;
    Ok(UptimeRecord {
        target_id: row.get(0)?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| conversion_error(1, e))?,
        total_checks: row.get::<_, i64>(2)? as u64,
        successful_checks: row.get::<_, i64>(3)? as u64,
        failed_checks: row.get::<_, i64>(4)? as u64,
        latency_sum_ms: row.get(5)?,
        latency_samples: row.get::<_, i64>(6)? as u64,
        downtime_seconds: row.get::<_, i64>(7)? as u64,
        sealed: row.get(8)?,
    })
}

fn event_from_row(row: &Row<'_>) -> SqlResult<NotificationEvent> {
    Ok(NotificationEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        target_id: row.get(2)?,
        notification_type: get_enum(row, 3)?,
        method: get_enum(row, 4)?,
        title: row.get(5)?,
        message: row.get(6)?,
        delivery_status: get_enum(row, 7)?,
        error_message: row.get(8)?,
        metadata: get_json(row, 9)?,
        sent_at: get_opt_time(row, 10)?,
        is_read: row.get(11)?,
        created_at: get_time(row, 12)?,
    })
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn get_enum<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn get_time(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| conversion_error(idx, BadValue(s)))
}

fn get_opt_time(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => parse_db_time(&s)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, BadValue(s))),
        None => Ok(None),
    }
}

fn format_db_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::validation::ValidationError;
    use std::collections::BTreeMap;
    use tempfile::NamedTempFile;
    use tokio_test::assert_ok;

    fn store_with_user() -> (NamedTempFile, Store, User) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut user = User {
            id: 0,
            username: "ops".to_string(),
            email: "ops@example.com".to_string(),
            full_name: "Ops Team".to_string(),
            is_active: true,
            email_notifications_enabled: true,
            created_at: Utc::now(),
        };
        store.add_user(&mut user).unwrap();
        (tmp, store, user)
    }

    fn sample_target(user_id: UserId) -> Target {
        let mut headers = BTreeMap::new();
        headers.insert("X-Probe".to_string(), "1".to_string());
        Target {
            user_id,
            name: "Example".to_string(),
            url: "https://example.com".to_string(),
            monitor_type: MonitorType::Https,
            custom_headers: headers,
            tags: vec!["prod".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_target_crud() {
        let (_tmp, store, user) = store_with_user();

        let mut target = sample_target(user.id);
        let id = store.add_target(&mut target).unwrap();
        assert!(id > 0);

        let fetched = store.get_target(id).unwrap();
        assert_eq!(fetched.name, "Example");
        assert_eq!(fetched.monitor_type, MonitorType::Https);
        assert_eq!(fetched.custom_headers.get("X-Probe").map(String::as_str), Some("1"));
        assert_eq!(fetched.tags, vec!["prod".to_string()]);

        let mut updated = fetched;
        updated.name = "Updated".to_string();
        updated.is_active = false;
        store.update_target(&updated).unwrap();

        assert_eq!(store.get_target(id).unwrap().name, "Updated");
        assert!(store.list_active_targets().unwrap().is_empty());

        store.delete_target(id).unwrap();
        assert!(matches!(store.get_target(id), Err(StorageError::NotFound)));
    }

    #[test]
    fn test_runtime_state_upsert() {
        let (_tmp, store, user) = store_with_user();
        let mut target = sample_target(user.id);
        store.add_target(&mut target).unwrap();

        assert!(store.get_runtime_state(target.id).unwrap().is_none());

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let mut state = TargetRuntimeState::new(target.id);
        state.current_status = MonitorStatus::Down;
        state.consecutive_failures = 3;
        state.last_check_at = Some(at);
        state.last_status_change_at = Some(at);
        assert_ok!(store.save_runtime_state(&state));

        state.consecutive_failures = 4;
        assert_ok!(store.save_runtime_state(&state));

        assert_eq!(store.get_runtime_state(target.id).unwrap(), Some(state));
    }

    #[test]
    fn test_probe_results_round_trip() {
        let (_tmp, store, user) = store_with_user();
        let mut target = sample_target(user.id);
        store.add_target(&mut target).unwrap();

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let up = ProbeResult::up(target.id, 12.5, at);
        let down = ProbeResult::down(target.id, ProbeFailure::Timeout, "timed out", at + chrono::Duration::seconds(60));
        store.append_probe_result(&up).unwrap();
        store.append_probe_result(&down).unwrap();

        let results = store.list_probe_results(target.id, 10).unwrap();
        assert_eq!(results, vec![down, up]);
    }

    #[test]
    fn test_sealed_uptime_record_is_not_overwritten() {
        let (_tmp, store, user) = store_with_user();
        let mut target = sample_target(user.id);
        store.add_target(&mut target).unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut record = UptimeRecord::new(target.id, day);
        record.total_checks = 10;
        record.successful_checks = 8;
        record.failed_checks = 2;
        record.sealed = true;
        store.upsert_uptime_record(&record).unwrap();

        let mut late = record.clone();
        late.total_checks = 11;
        late.sealed = false;
        store.upsert_uptime_record(&late).unwrap();

        let stored = store.get_uptime_record(target.id, day).unwrap().unwrap();
        assert_eq!(stored, record);
        assert_eq!(stored.uptime_percentage(), 80.0);
        assert_eq!(store.list_uptime_records(target.id, day, day).unwrap().len(), 1);
    }

    #[test]
    fn test_settings_and_events() {
        let (_tmp, store, user) = store_with_user();
        let mut target = sample_target(user.id);
        store.add_target(&mut target).unwrap();

        let mut setting = NotificationSetting {
            id: 0,
            user_id: user.id,
            notification_type: NotificationType::DownAlert,
            method: NotificationMethod::Webhook,
            is_enabled: true,
            threshold_minutes: Some(10),
            webhook_url: Some("https://hooks.example.com/x".to_string()),
            custom_template: None,
        };
        store.add_notification_setting(&mut setting).unwrap();
        assert_eq!(store.list_notification_settings(user.id).unwrap(), vec![setting]);

        let mut event = NotificationEvent {
            id: 0,
            user_id: user.id,
            target_id: target.id,
            notification_type: NotificationType::DownAlert,
            method: NotificationMethod::Webhook,
            title: "down".to_string(),
            message: "Example is down".to_string(),
            delivery_status: DeliveryStatus::Pending,
            error_message: None,
            metadata: serde_json::json!({ "status": "down" }),
            sent_at: None,
            is_read: false,
            created_at: Utc::now(),
        };
        event.id = store.save_notification_event(&event).unwrap();
        assert!(event.id > 0);

        event.delivery_status = DeliveryStatus::Failed;
        event.error_message = Some("connection refused".to_string());
        store.save_notification_event(&event).unwrap();

        let events = store.list_notification_events(user.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delivery_status, DeliveryStatus::Failed);
        assert_eq!(events[0].metadata["status"], "down");
    }

    #[test]
    fn test_invalid_records_are_rejected() {
        let (_tmp, store, user) = store_with_user();

        let mut nameless = Target {
            name: " ".to_string(),
            ..sample_target(user.id)
        };
        assert!(matches!(
            store.add_target(&mut nameless),
            Err(StorageError::Invalid(ValidationError::Empty("name")))
        ));

        let mut target = sample_target(user.id);
        store.add_target(&mut target).unwrap();
        assert_eq!(target.url, "https://example.com/");

        let mut too_fast = target.clone();
        too_fast.check_interval_seconds = 5;
        assert!(matches!(store.update_target(&too_fast), Err(StorageError::Invalid(_))));
        assert_eq!(store.get_target(target.id).unwrap().check_interval_seconds, 300);

        let mut hook = NotificationSetting {
            id: 0,
            user_id: user.id,
            notification_type: NotificationType::DownAlert,
            method: NotificationMethod::Webhook,
            is_enabled: true,
            threshold_minutes: None,
            webhook_url: None,
            custom_template: None,
        };
        assert!(matches!(
            store.add_notification_setting(&mut hook),
            Err(StorageError::Invalid(ValidationError::MissingWebhookUrl))
        ));
        assert!(store.list_notification_settings(user.id).unwrap().is_empty());
    }

    #[test]
    fn test_monitoring_summary() {
        let (_tmp, store, user) = store_with_user();
        let since = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();

        let mut ids = Vec::new();
        for (name, active) in [("api", true), ("db", true), ("cdn", true), ("legacy", false)] {
            let mut target = Target {
                name: name.to_string(),
                is_active: active,
                ..sample_target(user.id)
            };
            ids.push(store.add_target(&mut target).unwrap());
        }
        for (id, status) in [(ids[0], MonitorStatus::Up), (ids[1], MonitorStatus::Down), (ids[3], MonitorStatus::Up)] {
            let mut state = TargetRuntimeState::new(id);
            state.current_status = status;
            store.save_runtime_state(&state).unwrap();
        }

        let old = since - chrono::Duration::hours(1);
        store.append_probe_result(&ProbeResult::up(ids[0], 99.0, old)).unwrap();
        store.append_probe_result(&ProbeResult::up(ids[0], 12.0, since)).unwrap();
        store.append_probe_result(&ProbeResult::up(ids[0], 18.0, since + chrono::Duration::minutes(5))).unwrap();
        let refused = ProbeResult::down(ids[1], ProbeFailure::Network, "refused", since + chrono::Duration::minutes(5));
        store.append_probe_result(&refused).unwrap();

        for (id, day, total, ok) in [(ids[0], 1, 10, 0), (ids[0], 2, 10, 9), (ids[1], 2, 10, 5)] {
            let mut record = UptimeRecord::new(id, NaiveDate::from_ymd_opt(2024, 3, day).unwrap());
            record.total_checks = total;
            record.successful_checks = ok;
            record.failed_checks = total - ok;
            store.upsert_uptime_record(&record).unwrap();
        }

        let summary = store.monitoring_summary(user.id, since).unwrap();
        assert_eq!(
            summary,
            MonitoringSummary {
                total_items: 4,
                active_items: 3,
                up_items: 1,
                down_items: 1,
                unknown_items: 1,
                recent_checks: 3,
                average_response_time_ms: Some(15.0),
                overall_uptime_percentage: 70.0,
            }
        );
    }

    #[test]
    fn test_parse_db_time_formats() {
        assert!(parse_db_time("2024-03-01 10:00:00.123456789").is_some());
        assert!(parse_db_time("2024-03-01 10:00:00").is_some());
        assert!(parse_db_time("2024-03-01T10:00:00Z").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
