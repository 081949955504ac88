//! Validation of user-supplied configuration.
//!
//! Everything here is a pure function from raw input to either a valid value
//! or a [`ValidationError`]. Invalid targets never reach the scheduler.

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::OnceLock;
use thiserror::Error;

use crate::db::{HttpMethod, MonitorType, NotificationMethod, NotificationSetting, Target, User, UserId};

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_URL_LEN: usize = 2000;
pub const MAX_CONTENT_LEN: usize = 1000;
pub const MAX_TEMPLATE_LEN: usize = 5000;
pub const MIN_INTERVAL_SECS: u32 = 60;
pub const MIN_TIMEOUT_SECS: u32 = 1;
pub const MAX_TIMEOUT_SECS: u32 = 300;
pub const MAX_THRESHOLD_MINUTES: u32 = 7 * 24 * 60;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: &'static str, min: u32, max: u32 },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("{monitor_type} targets must be {expected}")]
    InvalidAddress {
        monitor_type: MonitorType,
        expected: &'static str,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("webhook notifications require a webhook url")]
    MissingWebhookUrl,
}

fn default_interval() -> u32 {
    300
}

fn default_timeout() -> u32 {
    30
}

fn default_status() -> Option<u16> {
    Some(200)
}

fn default_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_monitor_type() -> MonitorType {
    MonitorType::Http
}

/// Raw input for a new target.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetDraft {
    pub user_id: UserId,
    pub name: String,
    pub url: String,
    #[serde(default = "default_monitor_type")]
    pub monitor_type: MonitorType,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    #[serde(default = "default_interval")]
    pub check_interval_seconds: u32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    #[serde(default = "default_status")]
    pub expected_status_code: Option<u16>,
    #[serde(default)]
    pub expected_content: Option<String>,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TargetDraft {
    pub fn new(user_id: UserId, name: impl Into<String>, url: impl Into<String>, monitor_type: MonitorType) -> Self {
        Self {
            user_id,
            name: name.into(),
            url: url.into(),
            monitor_type,
            method: default_method(),
            check_interval_seconds: default_interval(),
            timeout_seconds: default_timeout(),
            expected_status_code: default_status(),
            expected_content: None,
            custom_headers: BTreeMap::new(),
            tags: Vec::new(),
        }
    }
}

/// Partial update of an existing target. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub monitor_type: Option<MonitorType>,
    pub method: Option<HttpMethod>,
    pub check_interval_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub expected_status_code: Option<Option<u16>>,
    pub expected_content: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub custom_headers: Option<BTreeMap<String, String>>,
}

/// Validate a draft into a target with id 0 (the store assigns the id).
pub fn validate_target(draft: TargetDraft, now: DateTime<Utc>) -> Result<Target, ValidationError> {
    let target = Target {
        id: 0,
        user_id: draft.user_id,
        name: draft.name,
        url: draft.url,
        monitor_type: draft.monitor_type,
        method: draft.method,
        check_interval_seconds: draft.check_interval_seconds,
        timeout_seconds: draft.timeout_seconds,
        expected_status_code: draft.expected_status_code,
        expected_content: draft.expected_content,
        custom_headers: draft.custom_headers,
        tags: draft.tags,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    check_target(target)
}

/// Apply a partial update and re-validate the result.
pub fn apply_update(current: &Target, update: TargetUpdate, now: DateTime<Utc>) -> Result<Target, ValidationError> {
    let mut target = current.clone();
    if let Some(name) = update.name {
        target.name = name;
    }
    if let Some(url) = update.url {
        target.url = url;
    }
    if let Some(monitor_type) = update.monitor_type {
        target.monitor_type = monitor_type;
    }
    if let Some(method) = update.method {
        target.method = method;
    }
    if let Some(interval) = update.check_interval_seconds {
        target.check_interval_seconds = interval;
    }
    if let Some(timeout) = update.timeout_seconds {
        target.timeout_seconds = timeout;
    }
    if let Some(status) = update.expected_status_code {
        target.expected_status_code = status;
    }
    if let Some(content) = update.expected_content {
        target.expected_content = content;
    }
    if let Some(active) = update.is_active {
        target.is_active = active;
    }
    if let Some(tags) = update.tags {
        target.tags = tags;
    }
    if let Some(headers) = update.custom_headers {
        target.custom_headers = headers;
    }
    target.updated_at = now;
    check_target(target)
}

/// Re-check a target built outside [`validate_target`] and return its canonical form.
pub fn revalidate(target: &Target) -> Result<Target, ValidationError> {
    check_target(target.clone())
}

fn check_target(mut target: Target) -> Result<Target, ValidationError> {
    target.name = target.name.trim().to_string();
    check_text("name", &target.name, MAX_NAME_LEN)?;
    check_text("url", target.url.trim(), MAX_URL_LEN)?;

    if target.check_interval_seconds < MIN_INTERVAL_SECS {
        return Err(ValidationError::OutOfRange {
            field: "check_interval_seconds",
            min: MIN_INTERVAL_SECS,
            max: u32::MAX,
        });
    }
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&target.timeout_seconds) {
        return Err(ValidationError::OutOfRange {
            field: "timeout_seconds",
            min: MIN_TIMEOUT_SECS,
            max: MAX_TIMEOUT_SECS,
        });
    }
    if let Some(content) = &target.expected_content {
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(ValidationError::TooLong {
                field: "expected_content",
                max: MAX_CONTENT_LEN,
            });
        }
    }

    target.url = normalize_address(target.monitor_type, target.url.trim())?;

    for (name, value) in &target.custom_headers {
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| ValidationError::InvalidHeader(name.clone()))?;
        HeaderValue::from_str(value).map_err(|_| ValidationError::InvalidHeader(name.clone()))?;
    }

    Ok(target)
}

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

/// Check and canonicalize the address for a monitor type.
pub fn normalize_address(monitor_type: MonitorType, address: &str) -> Result<String, ValidationError> {
    match monitor_type {
        MonitorType::Http | MonitorType::Https => normalize_http(monitor_type, address),
        MonitorType::Tcp | MonitorType::Udp => {
            split_host_port(address).ok_or(ValidationError::InvalidAddress {
                monitor_type,
                expected: "host:port",
            })?;
            Ok(address.to_string())
        }
        MonitorType::Ping => {
            if address.parse::<IpAddr>().is_ok() || is_hostname(address) {
                Ok(address.to_string())
            } else {
                Err(ValidationError::InvalidAddress {
                    monitor_type,
                    expected: "a bare host name or IP address",
                })
            }
        }
    }
}

fn normalize_http(monitor_type: MonitorType, address: &str) -> Result<String, ValidationError> {
    let scheme = monitor_type.as_str();
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("{}://{}", scheme, address)
    };

    let url = Url::parse(&candidate).map_err(|e| ValidationError::InvalidUrl(format!("{}: {}", address, e)))?;
    if url.scheme() != scheme {
        return Err(ValidationError::InvalidAddress {
            monitor_type,
            expected: if scheme == "https" { "an https:// url" } else { "an http:// url" },
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::InvalidUrl(format!("{}: missing host", address)));
    }
    Ok(url.to_string())
}

/// Split `host:port` (with optional `[v6]` brackets).
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    if host.contains(':') && host.parse::<IpAddr>().is_err() {
        return None;
    }
    Some((host, port))
}

fn is_hostname(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?)*\.?$")
            .unwrap()
    });
    s.len() <= 253 && re.is_match(s)
}

/// Validate an account before it is stored.
pub fn validate_user(user: &User) -> Result<(), ValidationError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+$").unwrap()
    });

    check_text("username", user.username.trim(), 100)?;
    check_text("full_name", user.full_name.trim(), MAX_NAME_LEN)?;
    if user.email.len() > 255 || !re.is_match(&user.email) {
        return Err(ValidationError::InvalidEmail(user.email.clone()));
    }
    Ok(())
}

/// Validate a notification setting before it is stored.
pub fn validate_notification_setting(setting: &NotificationSetting) -> Result<(), ValidationError> {
    if let Some(minutes) = setting.threshold_minutes {
        if minutes > MAX_THRESHOLD_MINUTES {
            return Err(ValidationError::OutOfRange {
                field: "threshold_minutes",
                min: 0,
                max: MAX_THRESHOLD_MINUTES,
            });
        }
    }
    if let Some(template) = &setting.custom_template {
        if template.chars().count() > MAX_TEMPLATE_LEN {
            return Err(ValidationError::TooLong {
                field: "custom_template",
                max: MAX_TEMPLATE_LEN,
            });
        }
    }
    match (&setting.method, &setting.webhook_url) {
        (NotificationMethod::Webhook, None) => Err(ValidationError::MissingWebhookUrl),
        (_, Some(url)) => {
            check_text("webhook_url", url, MAX_URL_LEN)?;
            let parsed = Url::parse(url).map_err(|e| ValidationError::InvalidUrl(format!("{}: {}", url, e)))?;
            match parsed.scheme() {
                "http" | "https" => Ok(()),
                other => Err(ValidationError::InvalidUrl(format!("unsupported scheme {}", other))),
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NotificationType;

    fn draft(monitor_type: MonitorType, url: &str) -> TargetDraft {
        TargetDraft::new(1, "Site", url, monitor_type)
    }

    #[test]
    fn test_http_scheme_is_prepended() {
        let target = validate_target(draft(MonitorType::Https, "example.com/health"), Utc::now()).unwrap();
        assert_eq!(target.url, "https://example.com/health");
        assert!(target.is_active);
    }

    #[test]
    fn test_scheme_must_match_type() {
        let err = validate_target(draft(MonitorType::Https, "http://example.com"), Utc::now()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAddress { .. }));
    }

    #[test]
    fn test_interval_and_timeout_bounds() {
        let mut d = draft(MonitorType::Http, "example.com");
        d.check_interval_seconds = 30;
        assert!(matches!(
            validate_target(d, Utc::now()),
            Err(ValidationError::OutOfRange { field: "check_interval_seconds", .. })
        ));

        let mut d = draft(MonitorType::Http, "example.com");
        d.timeout_seconds = 301;
        assert!(matches!(
            validate_target(d, Utc::now()),
            Err(ValidationError::OutOfRange { field: "timeout_seconds", .. })
        ));
    }

    #[test]
    fn test_socket_addresses() {
        assert!(validate_target(draft(MonitorType::Tcp, "db.internal:5432"), Utc::now()).is_ok());
        assert!(validate_target(draft(MonitorType::Udp, "[::1]:53"), Utc::now()).is_ok());
        assert!(validate_target(draft(MonitorType::Tcp, "db.internal"), Utc::now()).is_err());
        assert!(validate_target(draft(MonitorType::Tcp, "db.internal:0"), Utc::now()).is_err());
        assert_eq!(split_host_port("[::1]:53"), Some(("::1", 53)));
    }

    #[test]
    fn test_ping_addresses() {
        assert!(validate_target(draft(MonitorType::Ping, "8.8.8.8"), Utc::now()).is_ok());
        assert!(validate_target(draft(MonitorType::Ping, "2001:db8::1"), Utc::now()).is_ok());
        assert!(validate_target(draft(MonitorType::Ping, "router.lan"), Utc::now()).is_ok());
        assert!(validate_target(draft(MonitorType::Ping, "http://router.lan"), Utc::now()).is_err());
    }

    #[test]
    fn test_empty_and_long_fields() {
        assert_eq!(
            validate_target(TargetDraft::new(1, "  ", "example.com", MonitorType::Http), Utc::now()).unwrap_err(),
            ValidationError::Empty("name")
        );
        let mut d = draft(MonitorType::Http, "example.com");
        d.expected_content = Some("x".repeat(MAX_CONTENT_LEN + 1));
        assert!(matches!(validate_target(d, Utc::now()), Err(ValidationError::TooLong { .. })));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut d = draft(MonitorType::Http, "example.com");
        d.custom_headers.insert("Bad Header".to_string(), "v".to_string());
        assert_eq!(
            validate_target(d, Utc::now()).unwrap_err(),
            ValidationError::InvalidHeader("Bad Header".to_string())
        );
    }

    #[test]
    fn test_update_revalidates() {
        let target = validate_target(draft(MonitorType::Http, "example.com"), Utc::now()).unwrap();
        let update = TargetUpdate {
            check_interval_seconds: Some(120),
            is_active: Some(false),
            ..Default::default()
        };
        let updated = apply_update(&target, update, Utc::now()).unwrap();
        assert_eq!(updated.check_interval_seconds, 120);
        assert!(!updated.is_active);

        let bad = TargetUpdate {
            timeout_seconds: Some(0),
            ..Default::default()
        };
        assert!(apply_update(&target, bad, Utc::now()).is_err());
    }

    #[test]
    fn test_revalidate_stored_target() {
        let stored = Target {
            name: "  api ".to_string(),
            url: "api.example.com".to_string(),
            ..Default::default()
        };
        let target = revalidate(&stored).unwrap();
        assert_eq!(target.name, "api");
        assert_eq!(target.url, "http://api.example.com/");

        let broken = Target {
            check_interval_seconds: 0,
            ..stored
        };
        assert!(matches!(
            revalidate(&broken),
            Err(ValidationError::OutOfRange { field: "check_interval_seconds", .. })
        ));
        assert_eq!(revalidate(&Target::default()).unwrap_err(), ValidationError::Empty("name"));
    }

    #[test]
    fn test_draft_deserializes_with_defaults() {
        let d: TargetDraft = serde_json::from_str(r#"{"user_id":1,"name":"x","url":"example.com"}"#).unwrap();
        assert_eq!(d.monitor_type, MonitorType::Http);
        assert_eq!(d.check_interval_seconds, 300);
        assert_eq!(d.expected_status_code, Some(200));
    }

    #[test]
    fn test_user_email() {
        let mut user = User {
            id: 0,
            username: "ops".to_string(),
            email: "ops@example.com".to_string(),
            full_name: "Ops".to_string(),
            is_active: true,
            email_notifications_enabled: true,
            created_at: Utc::now(),
        };
        assert!(validate_user(&user).is_ok());
        user.email = "not-an-email".to_string();
        assert!(matches!(validate_user(&user), Err(ValidationError::InvalidEmail(_))));
    }

    #[test]
    fn test_webhook_setting_requires_url() {
        let mut setting = NotificationSetting {
            id: 0,
            user_id: 1,
            notification_type: NotificationType::DownAlert,
            method: NotificationMethod::Webhook,
            is_enabled: true,
            threshold_minutes: None,
            webhook_url: None,
            custom_template: None,
        };
        assert_eq!(validate_notification_setting(&setting), Err(ValidationError::MissingWebhookUrl));

        setting.webhook_url = Some("ftp://hooks.example.com".to_string());
        assert!(validate_notification_setting(&setting).is_err());

        setting.webhook_url = Some("https://hooks.example.com/a".to_string());
        assert!(validate_notification_setting(&setting).is_ok());

        setting.threshold_minutes = Some(MAX_THRESHOLD_MINUTES + 1);
        assert!(validate_notification_setting(&setting).is_err());
    }
}
