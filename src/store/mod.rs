mod durable;
mod memory;

pub use durable::DurableStore;
pub use memory::MemoryStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::model::*;

/// Committed state of one week as seen by a reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// 0 until the week is first written.
    pub version: u64,
    pub committed_at: Option<Ms>,
    pub schedule: WeekSchedule,
}

#[derive(Debug)]
pub enum CommitOutcome {
    Committed(Arc<Snapshot>),
    /// Someone committed since `expected_version` was read. Nothing was written.
    Conflict { current_version: u64 },
}

/// Transactional document store holding one `WeekSchedule` per week.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn read_latest(&self, week: &WeekId) -> Result<Snapshot, StoreError>;

    /// Replace the week's schedule if its version is still `expected_version`.
    /// Reservations with `updated_at == None` are stamped with the commit time.
    async fn commit_if_unchanged(
        &self,
        week: &WeekId,
        expected_version: u64,
        schedule: WeekSchedule,
    ) -> Result<CommitOutcome, StoreError>;

    /// Push stream of every committed snapshot of `week`.
    fn subscribe(&self, week: &WeekId) -> broadcast::Receiver<Arc<Snapshot>>;
}

#[derive(Debug)]
pub enum StoreError {
    Wal(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build the successor of `prev`. Commit times strictly increase per week even
/// if the wall clock stalls or steps back.
pub(crate) fn next_snapshot(prev: &Snapshot, mut schedule: WeekSchedule, now: Ms) -> Snapshot {
    let committed_at = match prev.committed_at {
        Some(last) => now.max(last + 1),
        None => now,
    };
    for r in schedule.reservations.values_mut() {
        if r.updated_at.is_none() {
            r.updated_at = Some(committed_at);
        }
    }
    Snapshot {
        version: prev.version + 1,
        committed_at: Some(committed_at),
        schedule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn next_snapshot_stamps_pending_only() {
        let entry = CatalogEntry::new("FÍSICA", "2B", "DOCENTE");
        let caller = CallerId::new("u");
        let mut old = Reservation::from_catalog(Ulid::new(), &entry, Day::Mon, 0, &caller);
        old.updated_at = Some(5);
        let fresh = Reservation::from_catalog(Ulid::new(), &entry, Day::Mon, 1, &caller);

        let mut ws = WeekSchedule::default();
        ws.reservations.insert(old.id, old.clone());
        ws.reservations.insert(fresh.id, fresh.clone());

        let prev = Snapshot { version: 3, committed_at: Some(100), schedule: WeekSchedule::default() };
        let next = next_snapshot(&prev, ws, 200);
        assert_eq!(next.version, 4);
        assert_eq!(next.committed_at, Some(200));
        assert_eq!(next.schedule.reservations[&old.id].updated_at, Some(5));
        assert_eq!(next.schedule.reservations[&fresh.id].updated_at, Some(200));
    }

    #[test]
    fn commit_time_is_monotonic() {
        let prev = Snapshot { version: 1, committed_at: Some(1_000), schedule: WeekSchedule::default() };
        let next = next_snapshot(&prev, WeekSchedule::default(), 900);
        assert_eq!(next.committed_at, Some(1_001));
    }
}
