//! Assignment and exposure event stream
//!
//! Analytics consumers subscribe with bounded channels; a slow consumer
//! drops events rather than backpressuring the assignment path.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestEventKind {
    /// A subject was bucketed into a variant for the first time
    Assignment,
    /// An assigned subject was actually shown the variant
    Exposure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestEvent {
    pub test_id: String,
    pub subject_id: String,
    pub variant: String,
    pub kind: AbTestEventKind,
    pub timestamp: i64,
}

/// Fan-out bus for assignment and exposure events
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::Sender<AbTestEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<AbTestEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.write().unwrap().push(tx);
        rx
    }

    /// Deliver to every live subscriber. Full or closed channels drop
    /// the event; closed subscribers are pruned.
    pub fn publish(&self, event: AbTestEvent) {
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    test_id = %event.test_id,
                    "Event subscriber full; dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
