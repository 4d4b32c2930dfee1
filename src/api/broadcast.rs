// =============================================================================
// Broadcaster — fan-out of live candle updates to WebSocket subscribers
// =============================================================================
//
// Each subscriber owns a bounded queue. Publishing never waits: a subscriber
// whose queue is full or whose receiver is gone is removed, and the rest
// still get the update.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::market_data::CandleUpdate;

/// Handle returned by [`Broadcaster::subscribe`].
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Arc<CandleUpdate>>,
}

pub struct Broadcaster {
    subscribers: RwLock<HashMap<Uuid, mpsc::Sender<Arc<CandleUpdate>>>>,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        self.subscribers.write().insert(id, tx);
        debug!(subscriber = %id, "subscriber added");
        Subscription { id, receiver: rx }
    }

    /// Returns `false` if `id` was already gone.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "subscriber removed");
        }
        removed
    }

    /// Deliver `update` to every current subscriber. Returns how many
    /// received it.
    pub fn publish(&self, update: CandleUpdate) -> usize {
        let update = Arc::new(update);
        let snapshot: Vec<(Uuid, mpsc::Sender<Arc<CandleUpdate>>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(Arc::clone(&update)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "subscriber queue full, dropping subscriber");
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write();
            for id in &dead {
                subs.remove(id);
            }
            debug!(removed = dead.len(), remaining = subs.len(), "pruned subscribers");
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Drain the consumer-side queue on the broadcaster's own task.
    pub fn spawn_pump(self: &Arc<Self>, mut updates: mpsc::Receiver<CandleUpdate>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!("broadcaster pump started");
            while let Some(update) = updates.recv().await {
                this.publish(update);
            }
            info!("broadcaster pump stopped");
        })
    }
}
