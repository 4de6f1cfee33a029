use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::WeekId;
use crate::store::Snapshot;

const CHANNEL_CAPACITY: usize = 64;

/// Per-week broadcast of committed snapshots.
pub struct NotifyHub {
    channels: DashMap<WeekId, broadcast::Sender<Arc<Snapshot>>>,
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

    /// Subscribe to commits on a week. Creates the channel if needed.
    pub fn subscribe(&self, week: &WeekId) -> broadcast::Receiver<Arc<Snapshot>> {
        self.channels
            .entry(week.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening. Drops the channel once every receiver is gone.
    pub fn send(&self, week: &WeekId, snapshot: &Arc<Snapshot>) {
        let stale = match self.channels.get(week) {
            Some(sender) => sender.send(snapshot.clone()).is_err(),
            None => false,
        };
        if stale {
            self.channels.remove_if(week, |_, sender| sender.receiver_count() == 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let week = WeekId::new("lab", 1);
        let mut rx = hub.subscribe(&week);

        let snap = Arc::new(Snapshot { version: 1, ..Snapshot::default() });
        hub.send(&week, &snap);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.version, 1);
    }

    #[tokio::test]
    async fn weeks_are_separate_channels() {
        let hub = NotifyHub::new();
        let w1 = WeekId::new("lab", 1);
        let w2 = WeekId::new("lab", 2);
        let mut rx1 = hub.subscribe(&w1);

        hub.send(&w2, &Arc::new(Snapshot::default()));
        assert!(matches!(rx1.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&WeekId::new("lab", 1), &Arc::new(Snapshot::default()));
    }

    #[test]
    fn dropped_receivers_release_channel() {
        let hub = NotifyHub::new();
        let week = WeekId::new("lab", 4);
        drop(hub.subscribe(&week));
        hub.send(&week, &Arc::new(Snapshot::default()));
        assert!(hub.channels.get(&week).is_none());
    }
}
