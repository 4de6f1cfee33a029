use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::model::*;
use crate::store::Snapshot;

use super::{EngineError, Scheduler};

impl Scheduler {
    pub async fn schedule(&self, week: &WeekId) -> Result<Snapshot, EngineError> {
        Ok(self.store.read_latest(week).await?)
    }

    /// Reservations ordered by day, then start slot.
    pub async fn reservations(&self, week: &WeekId) -> Result<Vec<Reservation>, EngineError> {
        let snapshot = self.store.read_latest(week).await?;
        Ok(snapshot.schedule.ordered().into_iter().cloned().collect())
    }

    /// Current snapshot of `week`, then every later commit. A subscriber that
    /// falls behind skips to the latest state.
    pub fn watch(&self, week: &WeekId) -> impl Stream<Item = Arc<Snapshot>> + Send + use<> {
        let rx = self.store.subscribe(week);
        let store = self.store.clone();
        let week = week.clone();

        stream::unfold((rx, store, week, None::<u64>), |(mut rx, store, week, seen)| async move {
            let next = match seen {
                None => store.read_latest(&week).await.ok().map(Arc::new),
                Some(seen) => loop {
                    match rx.recv().await {
                        Ok(snap) if snap.version > seen => break Some(snap),
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("{week}: watcher lagged by {skipped}, re-reading");
                            match store.read_latest(&week).await {
                                Ok(snap) if snap.version > seen => break Some(Arc::new(snap)),
                                Ok(_) => continue,
                                Err(_) => break None,
                            }
                        }
                        Err(RecvError::Closed) => break None,
                    }
                },
            };
            next.map(|snap| {
                let version = snap.version;
                (snap, (rx, store, week, Some(version)))
            })
        })
    }
}
