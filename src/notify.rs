use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::messaging::MessagingChannel;
use crate::models::{
    Inbox, Notification, NotificationKind, NotificationPrefs, NotificationPriority, UserSettings,
};
use crate::store::{self, DocumentStore, keys};

/// Inbox documents are trimmed to this many records; oldest fall off.
const INBOX_CAP: usize = 200;

/// Notification to be recorded, before id/timestamps are assigned.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub data: serde_json::Value,
}

impl NotificationDraft {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            priority: NotificationPriority::Medium,
            data: serde_json::Value::Null,
        }
    }

    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Records notifications and fans them out to external channels.
///
/// Recording is the source of truth and always happens; pushing to a
/// channel is policy (preferences, quiet hours) applied at delivery time,
/// and a channel failure is logged and swallowed so it can never unwind
/// the domain event that triggered it.
pub struct NotificationManager {
    store: Arc<dyn DocumentStore>,
    channels: Vec<Arc<dyn MessagingChannel>>,
}

impl NotificationManager {
    pub fn new(store: Arc<dyn DocumentStore>, channels: Vec<Arc<dyn MessagingChannel>>) -> Self {
        Self { store, channels }
    }

    /// Append a notification record and push it out where preferences allow.
    /// Only a storage failure is an error; delivery problems are swallowed.
    pub async fn send(&self, user_id: &str, draft: NotificationDraft) -> Result<Notification> {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind: draft.kind,
            title: draft.title,
            message: draft.message,
            priority: draft.priority,
            read: false,
            created_at: Utc::now(),
            data: draft.data,
        };

        let record = notification.clone();
        store::merge_doc(self.store.as_ref(), &keys::inbox(user_id), move |mut inbox: Inbox| {
            inbox.notifications.push(record.clone());
            inbox.unread += 1;
            if inbox.notifications.len() > INBOX_CAP {
                let overflow = inbox.notifications.len() - INBOX_CAP;
                let dropped_unread = inbox
                    .notifications
                    .iter()
                    .take(overflow)
                    .filter(|n| !n.read)
                    .count() as u32;
                inbox.notifications.drain(..overflow);
                inbox.unread = inbox.unread.saturating_sub(dropped_unread);
            }
            inbox
        })
        .await?;

        let prefs = self.load_prefs(user_id).await;
        self.push_to_channels(&prefs, &notification, Utc::now()).await;

        Ok(notification)
    }

    /// Newest-first listing.
    pub async fn list(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Notification>> {
        let inbox: Inbox = store::get_doc(self.store.as_ref(), &keys::inbox(user_id))
            .await?
            .unwrap_or_default();

        let mut notifications: Vec<Notification> = inbox
            .notifications
            .into_iter()
            .filter(|n| !unread_only || !n.read)
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            notifications.truncate(limit);
        }
        Ok(notifications)
    }

    /// Mark the given ids read. Unknown ids are ignored. Returns how many
    /// notifications actually transitioned.
    pub async fn mark_as_read(&self, user_id: &str, ids: &[Uuid]) -> Result<u32> {
        let ids: std::collections::HashSet<Uuid> = ids.iter().copied().collect();
        let before = self.unread_count(user_id).await?;
        let inbox: Inbox = store::merge_doc(
            self.store.as_ref(),
            &keys::inbox(user_id),
            move |mut inbox: Inbox| {
                let mut marked = 0u32;
                for notification in &mut inbox.notifications {
                    if !notification.read && ids.contains(&notification.id) {
                        notification.read = true;
                        marked += 1;
                    }
                }
                inbox.unread = inbox.unread.saturating_sub(marked);
                inbox
            },
        )
        .await?;
        Ok(before.saturating_sub(inbox.unread))
    }

    /// O(1): reads the maintained counter, never scans.
    pub async fn unread_count(&self, user_id: &str) -> Result<u32> {
        let inbox: Option<Inbox> =
            store::get_doc(self.store.as_ref(), &keys::inbox(user_id)).await?;
        Ok(inbox.map(|i| i.unread).unwrap_or(0))
    }

    /// Send the unread notifications as one email digest. Used by the
    /// scheduled digest task; returns a short human summary for the task
    /// log. Channel failures are logged and swallowed like any delivery.
    pub async fn send_digest(&self, user_id: &str) -> Result<String> {
        let prefs = self.load_prefs(user_id).await;
        if !prefs.email_digest {
            return Ok("digest disabled".to_string());
        }
        let Some(email) = prefs.email.clone() else {
            return Ok("digest skipped: no email on file".to_string());
        };

        let unread = self.list(user_id, true, Some(50)).await?;
        if unread.is_empty() {
            return Ok("digest skipped: nothing unread".to_string());
        }

        let mut body = format!("{} unread update(s):\n\n", unread.len());
        for notification in &unread {
            body.push_str(&format!(
                "- [{}] {}: {}\n",
                notification.created_at.format("%Y-%m-%d %H:%M"),
                notification.title,
                notification.message
            ));
        }

        let subject = format!("Job search digest: {} update(s)", unread.len());
        for channel in &self.channels {
            if channel.name() != "email" {
                continue;
            }
            if let Err(e) = channel.send_message(&email, Some(&subject), &body).await {
                warn!(channel = channel.name(), error = %e, "digest delivery failed");
                return Ok("digest delivery failed (logged)".to_string());
            }
        }
        Ok(format!("digest sent with {} update(s)", unread.len()))
    }

    async fn load_prefs(&self, user_id: &str) -> NotificationPrefs {
        match store::get_doc::<UserSettings>(self.store.as_ref(), &keys::settings(user_id)).await {
            Ok(Some(settings)) => settings.notifications,
            Ok(None) => NotificationPrefs::default(),
            Err(e) => {
                warn!(user = user_id, error = %e, "unreadable settings, defaulting prefs");
                NotificationPrefs::default()
            }
        }
    }

    /// Push one notification to the immediate channels (SMS/WhatsApp).
    /// The email channel only carries the batched digest.
    pub(crate) async fn push_to_channels(
        &self,
        prefs: &NotificationPrefs,
        notification: &Notification,
        now: DateTime<Utc>,
    ) {
        if in_quiet_hours(prefs, now) {
            debug!(title = %notification.title, "quiet hours, not pushing");
            return;
        }
        let Some(phone) = prefs.phone_number.clone() else {
            return;
        };

        let body = format!("{}: {}", notification.title, notification.message);
        for channel in &self.channels {
            let wanted = match channel.name() {
                "sms" => prefs.sms,
                "whatsapp" => prefs.whatsapp,
                _ => false,
            };
            if !wanted {
                continue;
            }
            if let Err(e) = channel.send_message(&phone, None, &body).await {
                warn!(channel = channel.name(), error = %e, "notification delivery failed");
            }
        }
    }
}

/// Quiet-hours check in the user's local clock. A window may wrap midnight
/// (22 -> 7). Equal start and end means no window.
pub fn in_quiet_hours(prefs: &NotificationPrefs, now: DateTime<Utc>) -> bool {
    let (Some(start), Some(end)) = (prefs.quiet_hours_start, prefs.quiet_hours_end) else {
        return false;
    };
    if start == end {
        return false;
    }
    let local = now + chrono::Duration::minutes(prefs.utc_offset_minutes as i64);
    let hour = local.hour();
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}
