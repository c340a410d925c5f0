use crate::model::lorawan::Eui;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// Handle returned by `subscribe`; pass it back to `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Route<T> {
    id: SubscriptionId,
    eui: Eui,
    tx: mpsc::Sender<T>,
}

/// Routes events to subscribers by EUI. Every subscriber to an EUI gets its
/// own copy. Subscribers that fall behind lose events.
pub struct EventRouter<T> {
    routes: Mutex<Vec<Route<T>>>,
    channel_length: usize,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> EventRouter<T> {
    pub fn new(channel_length: usize) -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            channel_length: channel_length.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, eui: Eui) -> (SubscriptionId, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(self.channel_length);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.routes.lock().push(Route { id, eui, tx });
        (id, rx)
    }

    /// Drops the sender so the receiver sees the end of the stream
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.routes.lock().retain(|r| r.id != id);
    }

    pub fn publish(&self, eui: Eui, event: T) {
        let mut routes = self.routes.lock();
        routes.retain(|route| {
            if route.eui != eui {
                return true;
            }
            match route.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(eui = %eui, "Subscriber isn't keeping up with events, skipping event");
                    true
                }
                // Receiver dropped without unsubscribing
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self, eui: &Eui) -> usize {
        self.routes.lock().iter().filter(|r| &r.eui == eui).count()
    }
}
