//! Change notification bus
//!
//! Decouples the service that mutates a record from the services whose
//! records embed relations to it. Subscribers register under a topic (the
//! referenced record type); `notify` fans a [`ChangeNotification`] out to
//! every subscriber of its topic in registration order.
//!
//! One bus is built per process and shared through
//! [`ServiceContext`](crate::context::ServiceContext).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relindex_storage::Record;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::Identity;
use crate::error::{Result, SyncError};

/// One changed record: `(external pid, internal id, revision)`
///
/// The internal id is the join key used to find referencing documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordChange {
    pub pid: String,
    pub id: Uuid,
    pub revision_id: u64,
}

impl RecordChange {
    pub fn new(pid: impl Into<String>, id: Uuid, revision_id: u64) -> Self {
        Self {
            pid: pid.into(),
            id,
            revision_id,
        }
    }

    /// `<id>::<revision>` stamp matching the one embedded in resolved relations
    pub fn version_stamp(&self) -> String {
        format!("{}::{}", self.id, self.revision_id)
    }
}

impl From<&Record> for RecordChange {
    fn from(record: &Record) -> Self {
        Self::new(record.pid.clone(), record.id, record.revision_id)
    }
}

/// Payload delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Referenced record type whose records changed
    pub topic: String,
    pub identity: Identity,
    /// Changed records, in the order the handler must chunk them
    pub changes: Vec<RecordChange>,
    pub notified_at: DateTime<Utc>,
    /// Maximum clauses per generated reindex query
    pub batch_limit: usize,
}

impl ChangeNotification {
    pub fn new(
        topic: impl Into<String>,
        identity: Identity,
        changes: Vec<RecordChange>,
        batch_limit: usize,
    ) -> Self {
        Self {
            topic: topic.into(),
            identity,
            changes,
            notified_at: Utc::now(),
            batch_limit,
        }
    }

    pub fn with_notified_at(mut self, notified_at: DateTime<Utc>) -> Self {
        self.notified_at = notified_at;
        self
    }
}

/// Callback registered on the bus
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn on_notification(&self, notification: &ChangeNotification) -> Result<()>;
}

/// Topic -> ordered subscribers
#[derive(Default)]
pub struct NotificationBus {
    topics: DashMap<String, Vec<Arc<dyn ChangeSubscriber>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber to `topic`, creating the topic if needed
    pub fn register(&self, topic: impl Into<String>, subscriber: Arc<dyn ChangeSubscriber>) {
        let topic = topic.into();
        debug!(topic = %topic, subscriber = subscriber.name(), "Registering change subscriber");
        self.topics.entry(topic).or_default().push(subscriber);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    /// Deliver `notification` to every subscriber of its topic
    ///
    /// Subscribers run one after another in registration order. The first
    /// failure stops delivery and is returned as `NotificationDelivery`.
    /// Registrations made while a delivery is in flight apply to the next
    /// `notify`.
    ///
    /// Returns the number of subscribers that handled the notification.
    pub async fn notify(&self, notification: &ChangeNotification) -> Result<usize> {
        // Snapshot so no map guard is held across an await
        let subscribers: Vec<Arc<dyn ChangeSubscriber>> = self
            .topics
            .get(&notification.topic)
            .map(|s| s.value().clone())
            .unwrap_or_default();

        if subscribers.is_empty() {
            debug!(topic = %notification.topic, "No subscribers, notification dropped");
            return Ok(0);
        }

        for subscriber in &subscribers {
            if let Err(e) = subscriber.on_notification(notification).await {
                warn!(
                    topic = %notification.topic,
                    subscriber = subscriber.name(),
                    error = %e,
                    "Change subscriber failed"
                );
                return Err(SyncError::NotificationDelivery {
                    topic: notification.topic.clone(),
                    source: Box::new(e),
                });
            }
        }

        debug!(
            topic = %notification.topic,
            subscribers = subscribers.len(),
            changes = notification.changes.len(),
            "Notification delivered"
        );
        Ok(subscribers.len())
    }
}
