//! Notifier dispatcher: decides which notifications a status update produces
//! and hands them to the delivery collaborator.
//!
//! Down-direction settings with a `threshold_minutes` are armed for a down
//! episode and fire once, on the first DOWN check at or after the threshold.
//! The episode is identified by the persisted `last_status_change_at`, so a
//! restarted engine re-arms from it. Recovery disarms them.

mod delivery;
mod render;

pub use delivery::*;
pub use render::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::db::{
    DeliveryStatus, MonitorStatus, NotificationEvent, NotificationMethod, NotificationSetting, NotificationType,
    ProbeFailure, ProbeResult, SettingId, Storage, StorageError, Target, TargetId, User,
};
use crate::tracker::StatusUpdate;

/// A rendered event waiting to be saved and delivered.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub event: NotificationEvent,
    pub webhook_url: Option<String>,
}

/// A threshold alert waiting on one down episode.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Armed {
    down_since: DateTime<Utc>,
    fired: bool,
}

pub struct Notifier {
    storage: Arc<dyn Storage>,
    delivery: Arc<dyn Deliver>,
    delivery_timeout: Duration,
    armed: Mutex<HashMap<(TargetId, SettingId), Armed>>,
}

impl Notifier {
    pub fn new(storage: Arc<dyn Storage>, delivery: Arc<dyn Deliver>, delivery_timeout: Duration) -> Self {
        Self {
            storage,
            delivery,
            delivery_timeout,
            armed: Mutex::new(HashMap::new()),
        }
    }

    fn armed(&self) -> MutexGuard<'_, HashMap<(TargetId, SettingId), Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide which notifications `update` calls for.
    pub fn evaluate(
        &self,
        target: &Target,
        update: &StatusUpdate,
        result: &ProbeResult,
    ) -> Result<Vec<PendingNotification>, StorageError> {
        let previous = update.previous;
        let current = update.state.current_status;

        let went_down = current == MonitorStatus::Down && previous != MonitorStatus::Down;
        let still_down = current == MonitorStatus::Down && previous == MonitorStatus::Down;
        let recovered = current == MonitorStatus::Up && previous == MonitorStatus::Down;

        if recovered {
            self.disarm(target.id);
        }
        if !(went_down || still_down || recovered) {
            return Ok(Vec::new());
        }

        let Some(user) = self.storage.get_user(target.user_id)? else {
            tracing::debug!("Notifier: no user {} for target {}", target.user_id, target.name);
            return Ok(Vec::new());
        };
        if !user.is_active {
            return Ok(Vec::new());
        }

        let settings = self.storage.list_notification_settings(user.id)?;
        let mut fire = Vec::new();

        if went_down || still_down {
            let down_since = update.state.last_status_change_at.unwrap_or(result.checked_at);
            let timed_out = result.failure == Some(ProbeFailure::Timeout);
            let mut armed = self.armed();

            for setting in &settings {
                if !setting.is_enabled || !is_down_direction(setting.notification_type, timed_out) {
                    continue;
                }
                let minutes = match setting.threshold_minutes {
                    Some(minutes) if minutes > 0 => minutes,
                    // Immediate alerts go out with the transition only
                    _ => {
                        if went_down {
                            fire.push(setting);
                        }
                        continue;
                    }
                };

                // Arms on the transition, or lazily when the episode began before a restart
                let entry = armed.entry((target.id, setting.id)).or_insert(Armed {
                    down_since,
                    fired: false,
                });
                if entry.down_since != down_since {
                    *entry = Armed {
                        down_since,
                        fired: false,
                    };
                }
                if !entry.fired && result.checked_at >= down_since + ChronoDuration::minutes(i64::from(minutes)) {
                    entry.fired = true;
                    fire.push(setting);
                }
            }
            // Settings deleted or disabled while armed
            armed.retain(|(t, s), _| *t != target.id || settings.iter().any(|x| x.id == *s && x.is_enabled));
        } else {
            fire.extend(settings.iter().filter(|s| {
                s.is_enabled
                    && matches!(
                        s.notification_type,
                        NotificationType::StatusChange | NotificationType::UpAlert
                    )
            }));
        }

        Ok(fire
            .into_iter()
            .filter(|s| allows_method(&user, s.method))
            .map(|s| build(target, s, previous, current, result))
            .collect())
    }

    fn disarm(&self, target_id: TargetId) {
        self.armed().retain(|(t, _), _| *t != target_id);
    }

    /// Forget armed alerts for a target that is no longer scheduled.
    pub fn evict(&self, target_id: TargetId) {
        self.disarm(target_id);
    }

    /// Save each event, deliver it, and record the outcome. Never retries.
    pub async fn dispatch(&self, pending: Vec<PendingNotification>) -> Vec<NotificationEvent> {
        let mut done = Vec::with_capacity(pending.len());
        for PendingNotification { mut event, webhook_url } in pending {
            match self.storage.save_notification_event(&event) {
                Ok(id) => event.id = id,
                Err(e) => {
                    tracing::error!("Notifier: failed to save event for target {}: {}", event.target_id, e);
                    continue;
                }
            }

            let outcome = tokio::time::timeout(
                self.delivery_timeout,
                self.delivery.deliver(&event, webhook_url.as_deref()),
            )
            .await
            .unwrap_or(Err(DeliveryError::Timeout(self.delivery_timeout)));

            match outcome {
                Ok(()) => {
                    event.delivery_status = DeliveryStatus::Sent;
                    event.sent_at = Some(Utc::now());
                }
                Err(e) => {
                    tracing::error!(
                        "Notifier: {} via {} failed for target {}: {}",
                        event.notification_type,
                        event.method,
                        event.target_id,
                        e
                    );
                    event.delivery_status = DeliveryStatus::Failed;
                    event.error_message = Some(e.to_string());
                }
            }

            if let Err(e) = self.storage.save_notification_event(&event) {
                tracing::error!("Notifier: failed to record delivery of event {}: {}", event.id, e);
            }
            done.push(event);
        }
        done
    }
}

fn is_down_direction(notification_type: NotificationType, timed_out: bool) -> bool {
    match notification_type {
        NotificationType::StatusChange | NotificationType::DownAlert => true,
        NotificationType::TimeoutAlert => timed_out,
        NotificationType::UpAlert => false,
    }
}

fn allows_method(user: &User, method: NotificationMethod) -> bool {
    method != NotificationMethod::Email || user.email_notifications_enabled
}

fn build(
    target: &Target,
    setting: &NotificationSetting,
    previous: MonitorStatus,
    current: MonitorStatus,
    result: &ProbeResult,
) -> PendingNotification {
    let ctx = RenderContext::new(target, result, previous, current, setting.notification_type);
    let (title, message) = render(&ctx, setting.custom_template.as_deref());
    PendingNotification {
        event: NotificationEvent {
            id: 0,
            user_id: setting.user_id,
            target_id: target.id,
            notification_type: setting.notification_type,
            method: setting.method,
            title,
            message,
            delivery_status: DeliveryStatus::Pending,
            error_message: None,
            metadata: metadata(&ctx),
            sent_at: None,
            is_read: false,
            created_at: Utc::now(),
        },
        webhook_url: setting.webhook_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::tracker::StatusTracker;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FailingDelivery;

    #[async_trait]
    impl Deliver for FailingDelivery {
        async fn deliver(&self, _event: &NotificationEvent, _url: Option<&str>) -> Result<(), DeliveryError> {
            Err(DeliveryError::Rejected("smtp relay refused".to_string()))
        }
    }

    struct HangingDelivery;

    #[async_trait]
    impl Deliver for HangingDelivery {
        async fn deliver(&self, _event: &NotificationEvent, _url: Option<&str>) -> Result<(), DeliveryError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        tracker: StatusTracker,
        notifier: Notifier,
        target: Target,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn fixture(delivery: Arc<dyn Deliver>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user(User {
            id: 0,
            username: "ops".to_string(),
            email: "ops@example.com".to_string(),
            full_name: "Ops".to_string(),
            is_active: true,
            email_notifications_enabled: true,
            created_at: t0(),
        });
        let target = store.put_target(Target {
            user_id: user.id,
            name: "api".to_string(),
            url: "https://api.example.com".to_string(),
            ..Default::default()
        });
        Fixture {
            tracker: StatusTracker::new(store.clone(), 1),
            notifier: Notifier::new(store.clone(), delivery, Duration::from_secs(5)),
            store,
            target,
        }
    }

    fn setting(fx: &Fixture, ty: NotificationType, method: NotificationMethod, threshold: Option<u32>) {
        fx.store.add_notification_setting(NotificationSetting {
            id: 0,
            user_id: fx.target.user_id,
            notification_type: ty,
            method,
            is_enabled: true,
            threshold_minutes: threshold,
            webhook_url: None,
            custom_template: None,
        });
    }

    fn observe(fx: &Fixture, result: ProbeResult) -> Vec<PendingNotification> {
        let update = fx.tracker.apply(&fx.target, &result).unwrap().unwrap();
        fx.notifier.evaluate(&fx.target, &update, &result).unwrap()
    }

    fn up(fx: &Fixture, minute: i64) -> ProbeResult {
        ProbeResult::up(fx.target.id, 12.0, t0() + ChronoDuration::minutes(minute))
    }

    fn down(fx: &Fixture, minute: i64) -> ProbeResult {
        ProbeResult::down(
            fx.target.id,
            ProbeFailure::Network,
            "refused",
            t0() + ChronoDuration::minutes(minute),
        )
    }

    fn types(pending: &[PendingNotification]) -> Vec<NotificationType> {
        pending.iter().map(|p| p.event.notification_type).collect()
    }

    #[test]
    fn test_down_alert_waits_for_threshold() {
        let fx = fixture(Arc::new(LogDelivery));
        setting(&fx, NotificationType::DownAlert, NotificationMethod::InApp, Some(10));

        assert!(observe(&fx, up(&fx, -1)).is_empty());

        // Goes DOWN at T and stays DOWN, checked every minute
        let mut fired_at = Vec::new();
        for minute in 0..=20 {
            if !observe(&fx, down(&fx, minute)).is_empty() {
                fired_at.push(minute);
            }
        }
        assert_eq!(fired_at, vec![10]);
    }

    #[test]
    fn test_threshold_alert_survives_restart() {
        let fx = fixture(Arc::new(LogDelivery));
        setting(&fx, NotificationType::DownAlert, NotificationMethod::InApp, Some(10));

        observe(&fx, up(&fx, -1));
        for minute in 0..5 {
            assert!(observe(&fx, down(&fx, minute)).is_empty());
        }

        // Engine restarts mid-episode: fresh tracker and notifier over the same storage
        let tracker = StatusTracker::new(fx.store.clone(), 1);
        let notifier = Notifier::new(fx.store.clone(), Arc::new(LogDelivery), Duration::from_secs(5));
        let mut fired_at = Vec::new();
        for minute in 5..=30 {
            let result = down(&fx, minute);
            let update = tracker.apply(&fx.target, &result).unwrap().unwrap();
            if !notifier.evaluate(&fx.target, &update, &result).unwrap().is_empty() {
                fired_at.push(minute);
            }
        }
        assert_eq!(fired_at, vec![10]);
    }

    #[test]
    fn test_threshold_alert_rearms_for_next_episode() {
        let fx = fixture(Arc::new(LogDelivery));
        setting(&fx, NotificationType::DownAlert, NotificationMethod::InApp, Some(2));

        observe(&fx, up(&fx, 0));
        let mut fired_at = Vec::new();
        for (minute, is_up) in [(1, false), (2, false), (3, false), (4, false), (5, true), (6, false), (8, false)] {
            let result = if is_up { up(&fx, minute) } else { down(&fx, minute) };
            if !observe(&fx, result).is_empty() {
                fired_at.push(minute);
            }
        }
        assert_eq!(fired_at, vec![3, 8]);
    }

    #[test]
    fn test_transient_blip_never_alerts_with_threshold() {
        let fx = fixture(Arc::new(LogDelivery));
        setting(&fx, NotificationType::DownAlert, NotificationMethod::InApp, Some(10));

        observe(&fx, up(&fx, 0));
        assert!(observe(&fx, down(&fx, 1)).is_empty());
        observe(&fx, up(&fx, 2));
        for minute in 3..30 {
            assert!(observe(&fx, up(&fx, minute)).is_empty());
        }
        assert!(fx.notifier.armed().is_empty());
    }

    #[test]
    fn test_down_alert_without_threshold_is_immediate() {
        let fx = fixture(Arc::new(LogDelivery));
        setting(&fx, NotificationType::DownAlert, NotificationMethod::InApp, None);
        setting(&fx, NotificationType::StatusChange, NotificationMethod::InApp, None);

        observe(&fx, up(&fx, 0));
        let pending = observe(&fx, down(&fx, 1));
        assert_eq!(types(&pending), vec![NotificationType::DownAlert, NotificationType::StatusChange]);
        assert_eq!(pending[0].event.title, "api is DOWN");

        // No repeat while the target stays down
        assert!(observe(&fx, down(&fx, 2)).is_empty());
    }

    #[test]
    fn test_recovery_sends_up_alert_only_after_down() {
        let fx = fixture(Arc::new(LogDelivery));
        setting(&fx, NotificationType::UpAlert, NotificationMethod::InApp, None);

        // Initial discovery is silent
        assert!(observe(&fx, up(&fx, 0)).is_empty());
        observe(&fx, down(&fx, 1));
        let pending = observe(&fx, up(&fx, 2));
        assert_eq!(types(&pending), vec![NotificationType::UpAlert]);
    }

    #[test]
    fn test_timeout_alert_only_for_timeouts() {
        let fx = fixture(Arc::new(LogDelivery));
        setting(&fx, NotificationType::TimeoutAlert, NotificationMethod::InApp, None);

        observe(&fx, up(&fx, 0));
        assert!(observe(&fx, down(&fx, 1)).is_empty());
        observe(&fx, up(&fx, 2));

        let timeout = ProbeResult::down(fx.target.id, ProbeFailure::Timeout, "timed out", t0() + ChronoDuration::minutes(3));
        assert_eq!(types(&observe(&fx, timeout)), vec![NotificationType::TimeoutAlert]);
    }

    #[test]
    fn test_email_respects_user_preference() {
        let fx = fixture(Arc::new(LogDelivery));
        let mut user = fx.store.get_user(fx.target.user_id).unwrap().unwrap();
        user.email_notifications_enabled = false;
        fx.store.add_user(user);
        setting(&fx, NotificationType::DownAlert, NotificationMethod::Email, None);
        setting(&fx, NotificationType::DownAlert, NotificationMethod::InApp, None);

        let pending = observe(&fx, down(&fx, 0));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.method, NotificationMethod::InApp);
    }

    #[test]
    fn test_custom_template_is_rendered() {
        let fx = fixture(Arc::new(LogDelivery));
        fx.store.add_notification_setting(NotificationSetting {
            id: 0,
            user_id: fx.target.user_id,
            notification_type: NotificationType::DownAlert,
            method: NotificationMethod::Webhook,
            is_enabled: true,
            threshold_minutes: None,
            webhook_url: Some("https://hooks.example.com/a".to_string()),
            custom_template: Some("{target_name} went {status}: {error}".to_string()),
        });

        let pending = observe(&fx, down(&fx, 0));
        assert_eq!(pending[0].event.message, "api went DOWN: refused");
        assert_eq!(pending[0].webhook_url.as_deref(), Some("https://hooks.example.com/a"));
        assert_eq!(pending[0].event.metadata["url"], "https://api.example.com");
    }

    #[tokio::test]
    async fn test_dispatch_records_sent() {
        let fx = fixture(Arc::new(LogDelivery));
        setting(&fx, NotificationType::DownAlert, NotificationMethod::InApp, None);

        let done = fx.notifier.dispatch(observe(&fx, down(&fx, 0))).await;
        assert_eq!(done.len(), 1);

        let stored = fx.store.notification_events();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delivery_status, DeliveryStatus::Sent);
        assert!(stored[0].sent_at.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_records_failure() {
        let fx = fixture(Arc::new(FailingDelivery));
        setting(&fx, NotificationType::DownAlert, NotificationMethod::Email, None);

        fx.notifier.dispatch(observe(&fx, down(&fx, 0))).await;

        let stored = fx.store.notification_events();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delivery_status, DeliveryStatus::Failed);
        assert_eq!(
            stored[0].error_message.as_deref(),
            Some("delivery rejected: smtp relay refused")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out_hanging_delivery() {
        let fx = fixture(Arc::new(HangingDelivery));
        setting(&fx, NotificationType::DownAlert, NotificationMethod::InApp, None);

        let done = fx.notifier.dispatch(observe(&fx, down(&fx, 0))).await;
        assert_eq!(done[0].delivery_status, DeliveryStatus::Failed);
        assert!(done[0].error_message.as_deref().unwrap_or_default().contains("timed out"));
    }
}
