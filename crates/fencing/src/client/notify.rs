//! Event subscriptions.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::message::{FenceEvent, Notification};
use crate::error::{FenceError, Result};

/// Handler for pushed events.
pub type NotifyCallback = Arc<dyn Fn(&FenceEvent) + Send + Sync>;

struct Subscription {
    event: String,
    /// Caller-chosen identity used to spot duplicate subscriptions.
    id: String,
    handler: NotifyCallback,
}

/// Subscribers of one connection, kept in subscription order.
#[derive(Clone, Default)]
pub struct NotificationHub {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler` for `event` under the identity `id`.
    ///
    /// The same `(event, id)` pair can only be subscribed once.
    pub fn subscribe(&self, event: &str, id: &str, handler: NotifyCallback) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions
            .iter()
            .any(|s| s.event == event && s.id == id)
        {
            warn!(event, id, "Callback already present");
            return Err(FenceError::DuplicateSubscription);
        }
        subscriptions.push(Subscription {
            event: event.to_string(),
            id: id.to_string(),
            handler,
        });
        trace!(event, id, total = subscriptions.len(), "Callback added");
        Ok(())
    }

    /// Remove the oldest subscription for `event`.
    pub fn unsubscribe(&self, event: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        match subscriptions.iter().position(|s| s.event == event) {
            Some(index) => {
                let removed = subscriptions.remove(index);
                debug!(event, id = %removed.id, "Removed callback");
                Ok(())
            }
            None => {
                trace!(event, "Callback not present");
                Err(FenceError::NotFound(format!("no subscription for {event}")))
            }
        }
    }

    /// Whether anyone listens to `event`.
    pub fn has_subscribers(&self, event: &str) -> bool {
        self.subscriptions.lock().iter().any(|s| s.event == event)
    }

    /// Distinct event names with at least one subscriber, in subscription order.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for subscription in self.subscriptions.lock().iter() {
            if !names.contains(&subscription.event) {
                names.push(subscription.event.clone());
            }
        }
        names
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    /// Decode a push and hand it to its subscribers.
    ///
    /// A push whose record cannot be decoded is logged and dropped.
    pub fn dispatch(&self, notification: &Notification) {
        match FenceEvent::from_notification(notification) {
            Ok(event) => self.broadcast(&event),
            Err(e) => warn!(
                event = %notification.subtype,
                error = %e,
                "Dropping malformed notification"
            ),
        }
    }

    /// Invoke every subscriber of `event.event`, oldest first.
    ///
    /// Handlers run without the subscriber lock held, so they may subscribe
    /// or unsubscribe themselves.
    pub fn broadcast(&self, event: &FenceEvent) {
        let handlers: Vec<NotifyCallback> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.event == event.event)
            .map(|s| Arc::clone(&s.handler))
            .collect();
        trace!(event = %event.event, subscribers = handlers.len(), "Sending notification");
        for handler in handlers {
            handler(event);
        }
    }

    pub fn clear(&self) {
        self.subscriptions.lock().clear();
    }
}
