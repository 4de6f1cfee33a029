use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::DurableStore;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` appends have piled
/// up since the last compaction.
pub async fn run_compactor(store: Arc<DurableStore>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold.max(1) {
            continue;
        }
        match store.compact().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted WAL after {appends} appends");
            }
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::store::ScheduleStore;
    use crate::wal::Wal;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotgrid_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Arc::new(DurableStore::open(&path, Arc::new(NotifyHub::new())).unwrap());
        let week = WeekId::new("lab", 2);
        for v in 0..6 {
            let mut ws = WeekSchedule::default();
            let r = Reservation::from_catalog(ulid::Ulid::new(), &CatalogEntry::new("S", "C", "O"), Day::Mon, 0, &CallerId::new("u"));
            ws.slots.insert(crate::slot_key::SlotKey::encode(Day::Mon, 0), r.id);
            ws.reservations.insert(r.id, r);
            store.commit_if_unchanged(&week, v, ws).await.unwrap();
        }

        let task = tokio::spawn(run_compactor(store.clone(), 5, Duration::from_millis(10)));
        for _ in 0..100 {
            if store.appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert_eq!(store.appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leaves_small_logs_alone() {
        let path = test_wal_path("below.wal");
        let store = Arc::new(DurableStore::open(&path, Arc::new(NotifyHub::new())).unwrap());
        let week = WeekId::new("lab", 3);
        store.commit_if_unchanged(&week, 0, WeekSchedule::default()).await.unwrap();

        let task = tokio::spawn(run_compactor(store.clone(), 1000, Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();

        assert_eq!(store.appends_since_compact().await, 1);
    }
}
