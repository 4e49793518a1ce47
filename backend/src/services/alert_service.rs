//! Alert lifecycle: raise, escalate, resolve and remind.
//!
//! At most one unresolved alert exists per `(alert_type, scope)`. Raising a
//! condition that already has an open alert leaves that alert in place,
//! bumping its severity if the new one is higher.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Alert, AlertSeverity, AlertType, NewAlert};
use crate::services::metrics_service;
use crate::services::notification_service::{Notification, NotificationService};
use crate::store::MetadataStore;

/// Result of [`AlertService::raise`].
#[derive(Debug, Clone, Serialize)]
pub struct RaisedAlert {
    pub alert: Alert,
    /// False when an open alert for the same condition already existed.
    pub created: bool,
}

pub struct AlertService {
    store: Arc<dyn MetadataStore>,
    notifications: Arc<NotificationService>,
    reminder_interval: Duration,
    /// Serializes read-modify-write cycles on alert records.
    lock: Mutex<()>,
}

impl AlertService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        notifications: Arc<NotificationService>,
        reminder_interval: Duration,
    ) -> Self {
        Self {
            store,
            notifications,
            reminder_interval,
            lock: Mutex::new(()),
        }
    }

    pub async fn raise(&self, new: NewAlert, now: DateTime<Utc>) -> Result<RaisedAlert> {
        let guard = self.lock.lock().await;

        if let Some(mut existing) = self
            .store
            .find_open_alert(new.alert_type, &new.scope)
            .await?
        {
            if new.severity <= existing.severity {
                return Ok(RaisedAlert {
                    alert: existing,
                    created: false,
                });
            }

            info!(
                alert_id = %existing.id,
                alert_type = %existing.alert_type,
                from = %existing.severity,
                to = %new.severity,
                "Alert escalated"
            );
            existing.severity = new.severity;
            existing.title = new.title;
            existing.message = new.message;
            existing.metadata = new.metadata;
            existing.last_notified_at = Some(now);
            self.store.upsert_alert(&existing).await?;
            drop(guard);

            self.notifications
                .notify(&notification_for(&existing, false))
                .await;
            self.refresh_gauges().await;
            return Ok(RaisedAlert {
                alert: existing,
                created: false,
            });
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type: new.alert_type,
            severity: new.severity,
            scope: new.scope,
            title: new.title,
            message: new.message,
            created_at: now,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            last_notified_at: Some(now),
            metadata: new.metadata,
        };
        self.store.upsert_alert(&alert).await?;
        drop(guard);

        warn!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            scope = %alert.scope,
            "Alert raised: {}",
            alert.title
        );
        self.notifications
            .notify(&notification_for(&alert, false))
            .await;
        self.refresh_gauges().await;

        Ok(RaisedAlert {
            alert,
            created: true,
        })
    }

    /// Resolve an alert by id. Resolving an already resolved alert is a no-op.
    pub async fn resolve(&self, id: Uuid, resolved_by: &str, now: DateTime<Utc>) -> Result<Alert> {
        let guard = self.lock.lock().await;
        let mut alert = self.get(id).await?;
        if alert.resolved {
            return Ok(alert);
        }
        alert.resolved = true;
        alert.resolved_at = Some(now);
        alert.resolved_by = Some(resolved_by.to_string());
        self.store.upsert_alert(&alert).await?;
        drop(guard);
        info!(alert_id = %id, alert_type = %alert.alert_type, resolved_by, "Alert resolved");
        self.refresh_gauges().await;
        Ok(alert)
    }

    /// Resolve the open alert for a condition, if any.
    pub async fn resolve_condition(
        &self,
        alert_type: AlertType,
        scope: &str,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        match self.store.find_open_alert(alert_type, scope).await? {
            Some(alert) => Ok(Some(self.resolve(alert.id, resolved_by, now).await?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Alert> {
        self.store
            .get_alert(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Alert {} not found", id)))
    }

    pub async fn open_alert(&self, alert_type: AlertType, scope: &str) -> Result<Option<Alert>> {
        self.store.find_open_alert(alert_type, scope).await
    }

    pub async fn list(&self, unresolved_only: bool) -> Result<Vec<Alert>> {
        self.store.list_alerts(unresolved_only).await
    }

    /// Re-notify critical alerts that have stayed open for a full reminder
    /// interval since their last notification. Returns how many were sent.
    pub async fn send_reminders(&self, now: DateTime<Utc>) -> Result<usize> {
        let due: Vec<Alert> = self
            .store
            .list_alerts(true)
            .await?
            .into_iter()
            .filter(|a| a.severity == AlertSeverity::Critical)
            .filter(|a| {
                let last = a.last_notified_at.unwrap_or(a.created_at);
                now - last >= self.reminder_interval
            })
            .collect();

        for alert in &due {
            self.notifications
                .notify(&notification_for(alert, true))
                .await;

            // Reload: the alert may have been resolved while the send was in flight.
            let _guard = self.lock.lock().await;
            match self.store.get_alert(alert.id).await? {
                Some(mut current) if !current.resolved => {
                    current.last_notified_at = Some(now);
                    self.store.upsert_alert(&current).await?;
                }
                _ => debug!(alert_id = %alert.id, "Alert resolved during reminder"),
            }
        }
        Ok(due.len())
    }

    async fn refresh_gauges(&self) {
        let open = match self.store.list_alerts(true).await {
            Ok(open) => open,
            Err(e) => {
                warn!("Failed to count open alerts: {}", e);
                return;
            }
        };
        for severity in [
            AlertSeverity::Info,
            AlertSeverity::Warning,
            AlertSeverity::Error,
            AlertSeverity::Critical,
        ] {
            let count = open.iter().filter(|a| a.severity == severity).count();
            metrics_service::set_open_alerts(severity, count);
        }
    }
}

fn notification_for(alert: &Alert, reminder: bool) -> Notification {
    Notification {
        title: alert.title.clone(),
        message: alert.message.clone(),
        severity: alert.severity,
        alert_type: Some(alert.alert_type),
        reminder,
        metadata: serde_json::json!({
            "alert_id": alert.id,
            "scope": alert.scope,
            "created_at": alert.created_at,
            "details": alert.metadata,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notification_service::tests::RecordingNotifier;
    use crate::services::notification_service::Notifier;
    use async_trait::async_trait;
    use crate::store::InMemoryStore;

    fn setup() -> (AlertService, Arc<RecordingNotifier>) {
        let recorder = Arc::new(RecordingNotifier::default());
        let notifications = Arc::new(NotificationService::new(vec![recorder.clone()]));
        let service = AlertService::new(
            Arc::new(InMemoryStore::new()),
            notifications,
            Duration::hours(4),
        );
        (service, recorder)
    }

    fn new_alert(severity: AlertSeverity) -> NewAlert {
        NewAlert {
            alert_type: AlertType::MissedBackup,
            severity,
            scope: "schedule-1".into(),
            title: "Backup missed".into(),
            message: "Daily DB is 2h late".into(),
            metadata: serde_json::json!({ "hours_late": 2 }),
        }
    }

    #[tokio::test]
    async fn test_raise_is_idempotent_per_condition() {
        let (service, recorder) = setup();
        let now = Utc::now();

        let first = service.raise(new_alert(AlertSeverity::Warning), now).await.unwrap();
        let second = service.raise(new_alert(AlertSeverity::Warning), now).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.alert.id, second.alert.id);
        assert_eq!(service.list(true).await.unwrap().len(), 1);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_raise_escalates_severity() {
        let (service, recorder) = setup();
        let now = Utc::now();
        let first = service.raise(new_alert(AlertSeverity::Warning), now).await.unwrap();
        let escalated = service.raise(new_alert(AlertSeverity::Critical), now).await.unwrap();

        assert_eq!(escalated.alert.id, first.alert.id);
        assert_eq!(escalated.alert.severity, AlertSeverity::Critical);
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);

        // Lower severity does not downgrade.
        let again = service.raise(new_alert(AlertSeverity::Warning), now).await.unwrap();
        assert_eq!(again.alert.severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_resolved_condition_can_be_raised_again() {
        let (service, _) = setup();
        let now = Utc::now();
        let first = service.raise(new_alert(AlertSeverity::Warning), now).await.unwrap();
        service.resolve(first.alert.id, "operator", now).await.unwrap();

        let second = service.raise(new_alert(AlertSeverity::Warning), now).await.unwrap();
        assert!(second.created);
        assert_ne!(second.alert.id, first.alert.id);
        assert_eq!(service.list(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reminders_only_for_critical_after_interval() {
        let (service, recorder) = setup();
        let start = Utc::now();
        service.raise(new_alert(AlertSeverity::Critical), start).await.unwrap();
        let mut warning = new_alert(AlertSeverity::Warning);
        warning.scope = "schedule-2".into();
        service.raise(warning, start).await.unwrap();

        assert_eq!(service.send_reminders(start + Duration::hours(3)).await.unwrap(), 0);
        assert_eq!(service.send_reminders(start + Duration::hours(4)).await.unwrap(), 1);
        // Clock restarts from the reminder.
        assert_eq!(service.send_reminders(start + Duration::hours(5)).await.unwrap(), 0);

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent[2].reminder);
    }

    /// Resolves the alert it is notified about, straight in the store, as an
    /// operator would while a reminder is being delivered.
    struct ResolvingNotifier {
        store: Arc<InMemoryStore>,
    }

    #[async_trait]
    impl Notifier for ResolvingNotifier {
        fn name(&self) -> &'static str {
            "resolving"
        }

        async fn send(&self, notification: &Notification) -> Result<()> {
            let id: Uuid = serde_json::from_value(notification.metadata["alert_id"].clone())
                .unwrap();
            let mut alert = self.store.get_alert(id).await?.unwrap();
            alert.resolved = true;
            alert.resolved_at = Some(Utc::now());
            alert.resolved_by = Some("operator".into());
            self.store.upsert_alert(&alert).await
        }
    }

    #[tokio::test]
    async fn test_reminder_does_not_reopen_alert_resolved_mid_send() {
        let store = Arc::new(InMemoryStore::new());
        let start = Utc::now();
        let quiet = AlertService::new(
            store.clone(),
            Arc::new(NotificationService::new(vec![])),
            Duration::hours(4),
        );
        let raised = quiet.raise(new_alert(AlertSeverity::Critical), start).await.unwrap();

        let service = AlertService::new(
            store.clone(),
            Arc::new(NotificationService::new(vec![Arc::new(ResolvingNotifier {
                store: store.clone(),
            })])),
            Duration::hours(4),
        );
        assert_eq!(service.send_reminders(start + Duration::hours(5)).await.unwrap(), 1);

        let alert = service.get(raised.alert.id).await.unwrap();
        assert!(alert.resolved);
        assert_eq!(alert.resolved_by.as_deref(), Some("operator"));
        assert_eq!(alert.last_notified_at, Some(start));
        assert!(service.list(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_alert() {
        let (service, _) = setup();
        let err = service
            .resolve(Uuid::new_v4(), "operator", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
