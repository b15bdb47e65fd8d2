use crate::domain::models::Notification;

/// Sink for outbound notifications.
///
/// Emission never fails from the caller's point of view; a notifier with no
/// listeners drops events.
pub trait Notifier: Send + Sync {
    fn emit(&self, notification: Notification);
}
