//! Domain model types shared by the engine and the storage layer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub type UserId = i64;
pub type TargetId = i64;
pub type SettingId = i64;

/// Declares a closed string-backed enum with `as_str`, `FromStr` and `Display`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Returned when a stored string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

string_enum!(
    /// Protocol used to check a target.
    MonitorType {
        Http => "http",
        Https => "https",
        Ping => "ping",
        Tcp => "tcp",
        Udp => "udp",
    }
);

string_enum!(
    /// Derived health of a target.
    MonitorStatus {
        Unknown => "unknown",
        Pending => "pending",
        Up => "up",
        Down => "down",
    }
);

string_enum!(
    HttpMethod {
        Get => "GET",
        Head => "HEAD",
        Post => "POST",
    }
);

string_enum!(
    /// Why a probe came back DOWN.
    ProbeFailure {
        Timeout => "timeout",
        Network => "network",
        ExpectationMismatch => "expectation_mismatch",
    }
);

string_enum!(
    NotificationType {
        StatusChange => "status_change",
        DownAlert => "down_alert",
        UpAlert => "up_alert",
        TimeoutAlert => "timeout_alert",
    }
);

string_enum!(
    NotificationMethod {
        Email => "email",
        InApp => "in_app",
        Webhook => "webhook",
    }
);

string_enum!(
    DeliveryStatus {
        Pending => "pending",
        Sent => "sent",
        Failed => "failed",
    }
);

/// An account that owns targets and notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub is_active: bool,
    pub email_notifications_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A monitoring target configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub user_id: UserId,
    pub name: String,
    /// URL for HTTP(S), `host:port` for TCP/UDP, bare host for PING.
    pub url: String,
    pub monitor_type: MonitorType,
    pub method: HttpMethod,
    pub check_interval_seconds: u32,
    pub timeout_seconds: u32,
    pub expected_status_code: Option<u16>,
    pub expected_content: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Target {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id: 0,
            name: String::new(),
            url: String::new(),
            monitor_type: MonitorType::Http,
            method: HttpMethod::Get,
            check_interval_seconds: 300,
            timeout_seconds: 30,
            expected_status_code: Some(200),
            expected_content: None,
            custom_headers: BTreeMap::new(),
            tags: Vec::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Target {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.check_interval_seconds.max(1)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds.max(1)))
    }
}

/// Immutable record of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: Uuid,
    pub target_id: TargetId,
    pub status: MonitorStatus,
    pub response_time_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub failure: Option<ProbeFailure>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body_sample: Option<String>,
    /// Completion time of the probe.
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    /// A successful check.
    pub fn up(target_id: TargetId, response_time_ms: f64, checked_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id,
            status: MonitorStatus::Up,
            response_time_ms: Some(response_time_ms),
            status_code: None,
            error_message: None,
            failure: None,
            response_headers: BTreeMap::new(),
            response_body_sample: None,
            checked_at,
        }
    }

    /// A failed check.
    pub fn down(
        target_id: TargetId,
        failure: ProbeFailure,
        error_message: impl Into<String>,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id,
            status: MonitorStatus::Down,
            response_time_ms: None,
            status_code: None,
            error_message: Some(error_message.into()),
            failure: Some(failure),
            response_headers: BTreeMap::new(),
            response_body_sample: None,
            checked_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == MonitorStatus::Up
    }
}

/// Derived per-target state, written only by the status tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRuntimeState {
    pub target_id: TargetId,
    pub current_status: MonitorStatus,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_status_change_at: Option<DateTime<Utc>>,
}

impl TargetRuntimeState {
    pub fn new(target_id: TargetId) -> Self {
        Self {
            target_id,
            current_status: MonitorStatus::Unknown,
            consecutive_failures: 0,
            last_check_at: None,
            last_status_change_at: None,
        }
    }
}

/// Daily uptime aggregate for one target.
///
/// Percentage and average latency are always derived from the raw counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeRecord {
    pub target_id: TargetId,
    pub date: NaiveDate,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub latency_sum_ms: f64,
    pub latency_samples: u64,
    pub downtime_seconds: u64,
    pub sealed: bool,
}

impl UptimeRecord {
    pub fn new(target_id: TargetId, date: NaiveDate) -> Self {
        Self {
            target_id,
            date,
            total_checks: 0,
            successful_checks: 0,
            failed_checks: 0,
            latency_sum_ms: 0.0,
            latency_samples: 0,
            downtime_seconds: 0,
            sealed: false,
        }
    }

    /// Successful / total, as a percentage rounded to two decimals.
    pub fn uptime_percentage(&self) -> f64 {
        percentage(self.successful_checks, self.total_checks)
    }

    pub fn average_response_time_ms(&self) -> Option<f64> {
        average(self.latency_sum_ms, self.latency_samples)
    }
}

/// Uptime summary over a range of days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeStats {
    pub uptime_percentage: f64,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub average_response_time_ms: Option<f64>,
    pub downtime_seconds: u64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// Dashboard overview of one user's targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSummary {
    pub total_items: u64,
    pub active_items: u64,
    /// Status counts cover active targets; PENDING and never-checked count as unknown.
    pub up_items: u64,
    pub down_items: u64,
    pub unknown_items: u64,
    pub recent_checks: u64,
    pub average_response_time_ms: Option<f64>,
    pub overall_uptime_percentage: f64,
}

pub(crate) fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 * 10_000.0 / total as f64).round() / 100.0
}

pub(crate) fn average(sum: f64, samples: u64) -> Option<f64> {
    if samples == 0 {
        return None;
    }
    Some((sum / samples as f64 * 1000.0).round() / 1000.0)
}

/// Per-user policy for one (type, method) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSetting {
    pub id: SettingId,
    pub user_id: UserId,
    pub notification_type: NotificationType,
    pub method: NotificationMethod,
    pub is_enabled: bool,
    /// Minutes a target must stay DOWN before down-direction alerts fire.
    pub threshold_minutes: Option<u32>,
    pub webhook_url: Option<String>,
    pub custom_template: Option<String>,
}

/// A decision to notify a user, plus its delivery outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Zero until the event has been saved.
    pub id: i64,
    pub user_id: UserId,
    pub target_id: TargetId,
    pub notification_type: NotificationType,
    pub method: NotificationMethod,
    pub title: String,
    pub message: String,
    pub delivery_status: DeliveryStatus,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub sent_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
