use crate::types::QueueState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Notifications published to external listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwitchyardEvent {
    /// A queue item moved to a new state.
    StatusChanged {
        /// The queue item.
        item_id: Uuid,
        /// Workflow the item was submitted under.
        workflow_id: Option<String>,
        /// The state entered.
        state: QueueState,
    },
    /// A workflow step finished.
    StepCompleted {
        /// Workflow the step ran in.
        workflow_id: String,
        /// Step name.
        step: String,
        /// Whether the step succeeded.
        success: bool,
    },
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&SwitchyardEvent) + Send + Sync>;

/// Callback registry for [`SwitchyardEvent`]s.
///
/// Callbacks run synchronously on the publishing task, outside the
/// registry lock, and must not block.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Callback)>>,
}

impl EventBus {
    /// Bus with no subscribers.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback for every event published from now on.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SwitchyardEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Subscribe through an unbounded channel. Sends to a dropped receiver
    /// are ignored until the subscription is removed.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<SwitchyardEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Remove a subscription. Returns false if it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Deliver an event to every current subscriber.
    pub fn publish(&self, event: &SwitchyardEvent) {
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
