//! Notification outbox.
//!
//! Domain operations call [`enqueue`] inside their own transaction, so a notification exists
//! exactly when the state change it announces was committed. [`dispatch_pending`] later hands
//! the rows to a [`NotificationPublisher`] in insertion order. A row is marked published only
//! after the publisher accepts it, which makes delivery at-least-once. Nothing in the
//! reservation lifecycle reads the outbox back.

use crate::{
    entities::{OutboxEvent, outbox_event},
    errors::{Error, Result},
};
use chrono::NaiveDateTime;
use sea_orm::{QueryOrder, QuerySelect, Set, prelude::*};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Template codes understood by the notification provider.
pub mod templates {
    pub const RESERVATION_CREATED: &str = "RESERVATION_CREATED";
    pub const RESERVATION_CANCELED: &str = "RESERVATION_CANCELED";
    pub const NO_SHOW_WARNING: &str = "NO_SHOW_WARNING";
    pub const DELIVERY_PAID: &str = "DELIVERY_PAID";
    pub const DELIVERY_STARTED: &str = "DELIVERY_STARTED";
}

/// Fire-and-forget sink for notifications (SMS, push, queue...).
pub trait NotificationPublisher: Send + Sync {
    /// Publishes one message.
    ///
    /// # Errors
    /// Returns an error if the provider rejected or could not accept the message; the outbox
    /// row stays pending and is retried on the next dispatch.
    fn publish(&self, template_code: &str, recipient: &str, variables: &Value) -> Result<()>;
}

/// Publisher that only writes the message to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublisher;

impl NotificationPublisher for LoggingPublisher {
    fn publish(&self, template_code: &str, recipient: &str, variables: &Value) -> Result<()> {
        info!(template_code, recipient, %variables, "notification");
        Ok(())
    }
}

/// Queues a notification in the caller's transaction.
pub async fn enqueue<C>(
    conn: &C,
    now: NaiveDateTime,
    template_code: &str,
    recipient: &str,
    variables: &Value,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let event = outbox_event::ActiveModel {
        template_code: Set(template_code.to_string()),
        recipient: Set(recipient.to_string()),
        variables: Set(variables.to_string()),
        attempts: Set(0),
        last_error: Set(None),
        created_at: Set(now),
        published_at: Set(None),
        ..Default::default()
    };
    event.insert(conn).await?;
    debug!(template_code, recipient, "notification queued");
    Ok(())
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Rows handed to the publisher and marked published
    pub published: usize,
    /// Set when a publish failed; the pass stops there to keep ordering
    pub failed: bool,
}

/// Publishes up to `limit` pending notifications, oldest first.
///
/// Stops at the first failure so later messages are never delivered ahead of earlier ones.
pub async fn dispatch_pending(
    db: &DatabaseConnection,
    publisher: &dyn NotificationPublisher,
    now: NaiveDateTime,
    limit: u64,
) -> Result<DispatchReport> {
    let pending = OutboxEvent::find()
        .filter(outbox_event::Column::PublishedAt.is_null())
        .order_by_asc(outbox_event::Column::Id)
        .limit(limit)
        .all(db)
        .await?;

    let mut report = DispatchReport::default();
    for event in pending {
        let outcome = serde_json::from_str::<Value>(&event.variables)
            .map_err(|e| {
                Error::validation(format!("Malformed variables on outbox {}: {e}", event.id))
            })
            .and_then(|vars| publisher.publish(&event.template_code, &event.recipient, &vars));

        let id = event.id;
        let attempts = event.attempts;
        let mut active: outbox_event::ActiveModel = event.into();
        match outcome {
            Ok(()) => {
                active.published_at = Set(Some(now));
                active.update(db).await?;
                report.published += 1;
            }
            Err(err) => {
                warn!(outbox_id = id, error = %err, "notification publish failed");
                active.attempts = Set(attempts + 1);
                active.last_error = Set(Some(err.to_string()));
                active.update(db).await?;
                report.failed = true;
                break;
            }
        }
    }

    if report.published > 0 {
        info!(published = report.published, "outbox dispatched");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, String)>>,
        fail_on: Option<String>,
    }

    impl NotificationPublisher for Recording {
        fn publish(&self, template_code: &str, recipient: &str, _variables: &Value) -> Result<()> {
            if self.fail_on.as_deref() == Some(recipient) {
                return Err(Error::validation("provider down"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((template_code.to_string(), recipient.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_publishes_in_order_once() -> Result<()> {
        let db = setup_test_db().await?;
        let now = local("2024-05-01 10:00");
        enqueue(&db, now, templates::RESERVATION_CREATED, "u1", &json!({"code": "R-1"})).await?;
        enqueue(&db, now, templates::RESERVATION_CANCELED, "u2", &json!({})).await?;

        let publisher = Recording::default();
        let report = dispatch_pending(&db, &publisher, now, 10).await?;
        assert_eq!(report.published, 2);
        assert!(!report.failed);

        let again = dispatch_pending(&db, &publisher, now, 10).await?;
        assert_eq!(again.published, 0);

        let sent = publisher.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                (templates::RESERVATION_CREATED.to_string(), "u1".to_string()),
                (templates::RESERVATION_CANCELED.to_string(), "u2".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_publish_stays_pending() -> Result<()> {
        let db = setup_test_db().await?;
        let now = local("2024-05-01 10:00");
        enqueue(&db, now, templates::NO_SHOW_WARNING, "u1", &json!({})).await?;
        enqueue(&db, now, templates::NO_SHOW_WARNING, "u2", &json!({})).await?;

        let failing = Recording {
            fail_on: Some("u1".to_string()),
            ..Default::default()
        };
        let report = dispatch_pending(&db, &failing, now, 10).await?;
        assert_eq!(report.published, 0);
        assert!(report.failed);

        let first = OutboxEvent::find()
            .order_by_asc(outbox_event::Column::Id)
            .one(&db)
            .await?
            .unwrap();
        assert_eq!(first.attempts, 1);
        assert!(first.published_at.is_none());
        assert!(first.last_error.is_some());

        let healthy = Recording::default();
        let report = dispatch_pending(&db, &healthy, now, 10).await?;
        assert_eq!(report.published, 2);
        Ok(())
    }
}
