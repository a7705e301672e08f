//! Notification sink and the in-memory inbox behind it.
//!
//! Producers (the transfer engine, the service desk) only see the
//! [`NotificationSink`] port. Delivery is best effort: a failed notify is
//! logged by the producer and never undoes the operation that triggered it.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::IdentityId;

pub type NotificationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationCategory {
    Transaction,
    ServiceRequest,
    CardRequest,
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotificationCategory::Transaction => "Transaction",
            NotificationCategory::ServiceRequest => "ServiceRequest",
            NotificationCategory::CardRequest => "CardRequest",
        })
    }
}

/// What a producer hands to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub recipient: IdentityId,
    pub title: String,
    pub message: String,
    pub category: NotificationCategory,
    /// Id of the transaction or service request this is about.
    pub related_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: IdentityId,
    pub title: String,
    pub message: String,
    pub category: NotificationCategory,
    pub related_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification {0} not found")]
    NotFound(NotificationId),

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: NewNotification) -> Result<(), NotifyError>;
}

#[derive(Default)]
struct Mailboxes {
    next_id: NotificationId,
    by_recipient: HashMap<IdentityId, Vec<Notification>>,
}

/// In-memory notification store.
#[derive(Default)]
pub struct Inbox {
    inner: Mutex<Mailboxes>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications for `recipient`, newest first. Read ones are included only on request.
    pub async fn list(&self, recipient: &str, include_read: bool) -> Vec<Notification> {
        let inner = self.inner.lock().await;
        let mut list: Vec<Notification> = inner
            .by_recipient
            .get(recipient)
            .into_iter()
            .flatten()
            .filter(|n| include_read || !n.is_read())
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        list
    }

    pub async fn unread_count(&self, recipient: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .by_recipient
            .get(recipient)
            .map_or(0, |list| list.iter().filter(|n| !n.is_read()).count())
    }

    /// Mark one of `recipient`'s notifications read. Marking twice keeps the first read time.
    pub async fn mark_read(&self, recipient: &str, id: NotificationId) -> Result<(), NotifyError> {
        let mut inner = self.inner.lock().await;
        let notification = inner
            .by_recipient
            .get_mut(recipient)
            .and_then(|list| list.iter_mut().find(|n| n.id == id))
            .ok_or(NotifyError::NotFound(id))?;
        notification.read_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    /// Returns how many were newly marked.
    pub async fn mark_all_read(&self, recipient: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut marked = 0;
        for notification in inner.by_recipient.get_mut(recipient).into_iter().flatten() {
            if notification.read_at.is_none() {
                notification.read_at = Some(now);
                marked += 1;
            }
        }
        marked
    }
}

#[async_trait]
impl NotificationSink for Inbox {
    async fn notify(&self, notification: NewNotification) -> Result<(), NotifyError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let stored = Notification {
            id: inner.next_id,
            recipient: notification.recipient,
            title: notification.title,
            message: notification.message,
            category: notification.category,
            related_id: notification.related_id,
            created_at: Utc::now(),
            read_at: None,
        };
        inner
            .by_recipient
            .entry(stored.recipient.clone())
            .or_default()
            .push(stored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(recipient: &str, title: &str) -> NewNotification {
        NewNotification {
            recipient: recipient.to_string(),
            title: title.to_string(),
            message: String::new(),
            category: NotificationCategory::Transaction,
            related_id: None,
        }
    }

    #[tokio::test]
    async fn list_and_mark_read() {
        let inbox = Inbox::new();
        inbox.notify(note("alice", "first")).await.unwrap();
        inbox.notify(note("alice", "second")).await.unwrap();
        inbox.notify(note("bob", "other")).await.unwrap();

        let unread = inbox.list("alice", false).await;
        assert_eq!(unread.len(), 2);
        assert_eq!(unread[0].title, "second");
        assert_eq!(inbox.unread_count("alice").await, 2);

        inbox.mark_read("alice", unread[1].id).await.unwrap();
        assert_eq!(inbox.unread_count("alice").await, 1);
        assert_eq!(inbox.list("alice", false).await.len(), 1);
        assert_eq!(inbox.list("alice", true).await.len(), 2);
    }

    #[tokio::test]
    async fn cannot_mark_someone_elses_notification() {
        let inbox = Inbox::new();
        inbox.notify(note("bob", "private")).await.unwrap();
        let id = inbox.list("bob", false).await[0].id;

        assert!(matches!(
            inbox.mark_read("alice", id).await,
            Err(NotifyError::NotFound(_))
        ));
        assert_eq!(inbox.unread_count("bob").await, 1);
    }

    #[tokio::test]
    async fn mark_all_read_counts_only_unread() {
        let inbox = Inbox::new();
        for title in ["a", "b", "c"] {
            inbox.notify(note("alice", title)).await.unwrap();
        }
        let first = inbox.list("alice", false).await[0].id;
        inbox.mark_read("alice", first).await.unwrap();

        assert_eq!(inbox.mark_all_read("alice").await, 2);
        assert_eq!(inbox.unread_count("alice").await, 0);
        assert_eq!(inbox.mark_all_read("nobody").await, 0);
    }
}
