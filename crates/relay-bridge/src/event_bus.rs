use std::sync::{Arc, Mutex};

use crate::protocol::EngineEvent;

/// Fan-out of [`EngineEvent`]s to every subscriber, over unbounded flume
/// channels.
///
/// A subscriber only sees events published after it subscribed. Clones share
/// one subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<EngineEvent>>>>,
}

impl EventBus {
    /// Bus with no subscribers yet. Clones publish to the same set.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// New unbounded receiver that sees every event published from now on.
    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber; senders whose receiver was
    /// dropped are removed here.
    pub fn publish(&self, event: EngineEvent) {
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Subscribers still registered, dropped ones included until the next publish.
    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> std::sync::MutexGuard<'_, Vec<flume::Sender<EngineEvent>>> {
        self.inner.lock().unwrap_or_else(|e| {
            tracing::warn!("event bus lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
