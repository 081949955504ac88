//! Title, message and metadata rendering for notification events.

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde_json::json;
use std::sync::OnceLock;

use crate::db::{MonitorStatus, NotificationType, ProbeResult, Target};

/// Values available to templates.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub target_name: String,
    pub url: String,
    pub status: MonitorStatus,
    pub previous_status: MonitorStatus,
    pub error: Option<String>,
    pub response_time_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub notification_type: NotificationType,
}

impl RenderContext {
    pub fn new(
        target: &Target,
        result: &ProbeResult,
        previous_status: MonitorStatus,
        status: MonitorStatus,
        notification_type: NotificationType,
    ) -> Self {
        Self {
            target_name: target.name.clone(),
            url: target.url.clone(),
            status,
            previous_status,
            error: result.error_message.clone(),
            response_time_ms: result.response_time_ms,
            timestamp: result.checked_at,
            notification_type,
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let value = match key {
            "target_name" => self.target_name.clone(),
            "url" => self.url.clone(),
            "status" => self.status.as_str().to_uppercase(),
            "previous_status" => self.previous_status.as_str().to_uppercase(),
            "error" => self.error.clone().unwrap_or_default(),
            "response_time_ms" => self.response_time_ms.map(|ms| format!("{:.1}", ms)).unwrap_or_default(),
            "timestamp" => self.timestamp.to_rfc3339(),
            "notification_type" => self.notification_type.as_str().to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Substitute `{placeholder}`s. Unknown placeholders are left as written.
pub fn render_template(template: &str, ctx: &RenderContext) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").unwrap());

    re.replace_all(template, |caps: &Captures| {
        ctx.lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

pub fn default_title(ctx: &RenderContext) -> String {
    match ctx.notification_type {
        NotificationType::StatusChange => format!(
            "{} is {}",
            ctx.target_name,
            ctx.status.as_str().to_uppercase()
        ),
        NotificationType::DownAlert => format!("{} is DOWN", ctx.target_name),
        NotificationType::UpAlert => format!("{} is back UP", ctx.target_name),
        NotificationType::TimeoutAlert => format!("{} timed out", ctx.target_name),
    }
}

pub fn default_message(ctx: &RenderContext) -> String {
    let mut message = format!(
        "{} ({}) changed from {} to {} at {}.",
        ctx.target_name,
        ctx.url,
        ctx.previous_status.as_str().to_uppercase(),
        ctx.status.as_str().to_uppercase(),
        ctx.timestamp.to_rfc3339()
    );
    if let Some(error) = &ctx.error {
        message.push_str(&format!(" Error: {}", error));
    }
    if let Some(ms) = ctx.response_time_ms {
        message.push_str(&format!(" Response time: {:.1} ms", ms));
    }
    message
}

/// Render title and message, preferring the custom template for the message body.
pub fn render(ctx: &RenderContext, custom_template: Option<&str>) -> (String, String) {
    let message = match custom_template {
        Some(template) if !template.trim().is_empty() => render_template(template, ctx),
        _ => default_message(ctx),
    };
    (default_title(ctx), message)
}

pub fn metadata(ctx: &RenderContext) -> serde_json::Value {
    json!({
        "url": ctx.url,
        "status": ctx.status,
        "previous_status": ctx.previous_status,
        "response_time_ms": ctx.response_time_ms,
        "error": ctx.error,
        "checked_at": ctx.timestamp.to_rfc3339(),
    })
}
