use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};

use crate::model::*;
use crate::notify::NotifyHub;

use super::{next_snapshot, now_ms, CommitOutcome, ScheduleStore, Snapshot, StoreError};

pub(crate) type SharedWeek = Arc<RwLock<Arc<Snapshot>>>;

/// In-process store. Each week is its own lock; weeks never contend.
pub struct MemoryStore {
    weeks: DashMap<WeekId, SharedWeek>,
    notify: Arc<NotifyHub>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(NotifyHub::new()))
    }
}

impl MemoryStore {
    pub fn new(notify: Arc<NotifyHub>) -> Self {
        Self {
            weeks: DashMap::new(),
            notify,
        }
    }

    pub(crate) fn week_cell(&self, week: &WeekId) -> SharedWeek {
        if let Some(cell) = self.weeks.get(week) {
            return cell.value().clone();
        }
        self.weeks
            .entry(week.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Arc::new(Snapshot::default()))))
            .value()
            .clone()
    }

    /// Install a snapshot without versioning checks. Replay only.
    pub(crate) fn restore(&self, week: WeekId, snapshot: Snapshot) {
        self.weeks.insert(week, Arc::new(RwLock::new(Arc::new(snapshot))));
    }

    pub(crate) fn week_ids(&self) -> Vec<WeekId> {
        self.weeks.iter().map(|e| e.key().clone()).collect()
    }

    pub(crate) fn notify(&self) -> &NotifyHub {
        &self.notify
    }

    /// Shared commit path. `persist` runs with the week's write lock held and
    /// must succeed before the new snapshot becomes visible.
    pub(crate) async fn commit_with<F, Fut>(
        &self,
        week: &WeekId,
        expected_version: u64,
        schedule: WeekSchedule,
        persist: F,
    ) -> Result<CommitOutcome, StoreError>
    where
        F: FnOnce(Arc<Snapshot>) -> Fut + Send,
        Fut: std::future::Future<Output = Result<(), StoreError>> + Send,
    {
        let cell = self.week_cell(week);
        let mut guard = cell.write().await;
        if guard.version != expected_version {
            return Ok(CommitOutcome::Conflict {
                current_version: guard.version,
            });
        }
        let next = Arc::new(next_snapshot(&guard, schedule, now_ms()));
        persist(next.clone()).await?;
        *guard = next.clone();
        drop(guard);
        self.notify.send(week, &next);
        Ok(CommitOutcome::Committed(next))
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn read_latest(&self, week: &WeekId) -> Result<Snapshot, StoreError> {
        let Some(cell) = self.weeks.get(week).map(|e| e.value().clone()) else {
            return Ok(Snapshot::default());
        };
        let guard = cell.read().await;
        Ok(Snapshot::clone(&guard))
    }

    async fn commit_if_unchanged(
        &self,
        week: &WeekId,
        expected_version: u64,
        schedule: WeekSchedule,
    ) -> Result<CommitOutcome, StoreError> {
        self.commit_with(week, expected_version, schedule, |_| async { Ok(()) })
            .await
    }

    fn subscribe(&self, week: &WeekId) -> broadcast::Receiver<Arc<Snapshot>> {
        self.notify.subscribe(week)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn week() -> WeekId {
        WeekId::new("lab", 1)
    }

    #[tokio::test]
    async fn unknown_week_reads_empty() {
        let store = MemoryStore::default();
        let snap = store.read_latest(&week()).await.unwrap();
        assert_eq!(snap.version, 0);
        assert_eq!(snap.committed_at, None);
        assert!(snap.schedule.reservations.is_empty());
    }

    #[tokio::test]
    async fn commit_bumps_version() {
        let store = MemoryStore::default();
        let out = store
            .commit_if_unchanged(&week(), 0, WeekSchedule::default())
            .await
            .unwrap();
        assert!(matches!(out, CommitOutcome::Committed(ref s) if s.version == 1));
        assert_eq!(store.read_latest(&week()).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts_without_write() {
        let store = MemoryStore::default();
        store.commit_if_unchanged(&week(), 0, WeekSchedule::default()).await.unwrap();
        let out = store
            .commit_if_unchanged(&week(), 0, WeekSchedule::default())
            .await
            .unwrap();
        assert!(matches!(out, CommitOutcome::Conflict { current_version: 1 }));
        assert_eq!(store.read_latest(&week()).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn subscribers_see_commits() {
        let store = MemoryStore::default();
        let mut rx = store.subscribe(&week());
        store.commit_if_unchanged(&week(), 0, WeekSchedule::default()).await.unwrap();
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.version, 1);
    }

    #[tokio::test]
    async fn failed_persist_leaves_state() {
        let store = MemoryStore::default();
        let out = store
            .commit_with(&week(), 0, WeekSchedule::default(), |_| async {
                Err(StoreError::Wal("disk full".into()))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(store.read_latest(&week()).await.unwrap().version, 0);
    }
}
