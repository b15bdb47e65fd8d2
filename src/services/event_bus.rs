//! Broadcast notification bus.
//!
//! The supervisor's production `Notifier`. Each notification is stamped with
//! an id and a bus-wide sequence number and fanned out to every subscriber.
//! Events published while nobody listens are dropped; a subscriber that
//! falls more than `capacity` events behind skips the gap.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::domain::models::Notification;
use crate::domain::ports::Notifier;

pub const DEFAULT_CAPACITY: usize = 1024;

/// A notification as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: Uuid,
    /// Publication order across all projects, starting at 0.
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub notification: Notification,
}

impl BusEvent {
    pub fn project_id(&self) -> &str {
        match &self.notification {
            Notification::TaskStarted { project_id, .. }
            | Notification::OutputChunk { project_id, .. }
            | Notification::TaskCompleted { project_id, .. }
            | Notification::TaskStatusChanged { project_id, .. } => project_id,
        }
    }
}

#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Stamp and fan out one notification. Returns its sequence number.
    pub fn publish(&self, notification: Notification) -> u64 {
        let sequence = self.published.fetch_add(1, Ordering::SeqCst);
        trace!(sequence, task_id = %notification.task_id(), "Publishing notification");
        // Fails only when there are no receivers.
        let _ = self.sender.send(BusEvent {
            id: Uuid::new_v4(),
            sequence,
            emitted_at: Utc::now(),
            notification,
        });
        sequence
    }

    /// Every event, from every project.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Events for one project only.
    pub fn subscribe_project(&self, project_id: impl Into<String>) -> ProjectEvents {
        ProjectEvents {
            project_id: project_id.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of notifications published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier for EventBus {
    fn emit(&self, notification: Notification) {
        self.publish(notification);
    }
}

/// Project-filtered view of the bus.
#[derive(Debug)]
pub struct ProjectEvents {
    project_id: String,
    receiver: broadcast::Receiver<BusEvent>,
}

impl ProjectEvents {
    /// Next event for this project; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.project_id() == self.project_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(project_id = %self.project_id, skipped, "Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
