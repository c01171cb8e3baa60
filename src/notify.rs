use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-pool broadcast of committed events.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a pool's events, creating its channel on first use.
    pub fn subscribe(&self, pool_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(pool_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to a pool's subscribers. Dropped if nobody listens.
    pub fn send(&self, pool_id: Ulid, event: &Event) {
        let orphaned = match self.channels.get(&pool_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        if orphaned {
            // Every receiver is gone.
            self.channels.remove_if(&pool_id, |_, s| s.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciled(pool_id: Ulid) -> Event {
        Event::OccupancyReconciled {
            pool_id,
            before: 3,
            after: 2,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_pool_events() {
        let hub = NotifyHub::new();
        let pool = Ulid::new();
        let mut rx = hub.subscribe(pool);

        hub.send(pool, &reconciled(pool));
        assert_eq!(rx.recv().await.unwrap(), reconciled(pool));
    }

    #[tokio::test]
    async fn other_pools_are_not_delivered() {
        let hub = NotifyHub::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut rx = hub.subscribe(a);

        hub.send(b, &reconciled(b));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_dropped_once_all_receivers_leave() {
        let hub = NotifyHub::new();
        let pool = Ulid::new();
        drop(hub.subscribe(pool));
        assert_eq!(hub.channel_count(), 1);

        hub.send(pool, &reconciled(pool));
        assert_eq!(hub.channel_count(), 0);
    }
}
