//! Delivery endpoints.
//!
//! A [`NotificationSink`] turns one claimed queue row into a chat message.
//! Sinks never touch the store; the dispatcher maps their outcome onto the
//! block counters.

mod telegram;

pub use telegram::{TelegramConfig, TelegramSink};

use async_trait::async_trait;

use crate::database::models::NotificationQueueDbModel;
use crate::domain::NotificationKind;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The recipient blocked us or no longer exists.
    Blocked,
    Failed(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Endpoint name matched against the queue's `endpoint` column.
    fn endpoint(&self) -> &str;

    async fn deliver(&self, notification: &NotificationQueueDbModel) -> DeliveryOutcome;
}

/// Plain-text rendering shared by sinks.
pub fn render_text(notification: &NotificationQueueDbModel) -> String {
    let name = &notification.entity_id;
    let site = &notification.site;

    match notification.notification_kind() {
        Some(NotificationKind::ProfileRemoved) => {
            format!("{name} was not found on {site} and has been removed from your list")
        }
        _ => {
            let duration = notification
                .time_diff
                .map(|secs| {
                    let previous = previous_state(&notification.status);
                    format!(" ({previous} {})", format_duration(secs))
                })
                .unwrap_or_default();
            match notification.status.as_str() {
                "online" => format!("{name} is online on {site}{duration}"),
                _ => format!("{name} went offline on {site}{duration}"),
            }
        }
    }
}

fn previous_state(status: &str) -> &'static str {
    if status == "online" {
        "was offline for"
    } else {
        "was online for"
    }
}

/// Compact human duration: `45s`, `12m`, `3h 5m`, `2d 4h`.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (days, hours, minutes) = (secs / 86_400, secs % 86_400 / 3_600, secs % 3_600 / 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn row(status: &str, kind: NotificationKind) -> NotificationQueueDbModel {
        NotificationQueueDbModel {
            id: 1,
            endpoint: "telegram".to_string(),
            chat_id: 42,
            site: "site".to_string(),
            entity_id: "alice".to_string(),
            status: status.to_string(),
            time_diff: Some(3_900),
            image_url: None,
            social: false,
            priority: 1,
            sound: true,
            kind: kind.as_str().to_string(),
            sending: 1,
            attempts: 0,
            last_error: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(720), "12m");
        assert_eq!(format_duration(3_900), "1h 5m");
        assert_eq!(format_duration(2 * 86_400 + 4 * 3_600), "2d 4h");
        assert_eq!(format_duration(-5), "0s");
    }

    #[test]
    fn test_render_text() {
        assert_eq!(
            render_text(&row("online", NotificationKind::StatusChange)),
            "alice is online on site (was offline for 1h 5m)"
        );
        assert_eq!(
            render_text(&row("offline", NotificationKind::StatusChange)),
            "alice went offline on site (was online for 1h 5m)"
        );
        let removed = render_text(&row("not_found", NotificationKind::ProfileRemoved));
        assert!(removed.contains("removed"));
    }
}
