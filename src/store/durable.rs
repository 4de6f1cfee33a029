use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{info, warn};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{CommitRecord, Wal};

use super::memory::MemoryStore;
use super::{CommitOutcome, ScheduleStore, Snapshot, StoreError};

enum WalCommand {
    Append {
        record: CommitRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<CommitRecord>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailNextFlush,
}

/// Owns the WAL. Appends that queue up while a flush is in progress share the
/// next fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// All or nothing: on error the whole batch is rejected and the WAL rolls
/// back to its last synced length before the next append.
fn flush_batch(wal: &mut Wal, batch: &[(CommitRecord, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (record, _) in batch {
        wal.append_buffered(record)?;
    }
    wal.flush_sync()
}

fn respond_batch(batch: Vec<(CommitRecord, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailNextFlush => wal.inject_flush_failure(),
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// WAL-backed store. A commit is visible to readers only after its record is
/// on disk.
pub struct DurableStore {
    weeks: MemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared, compaction exclusively, so no append can land
    /// in a log that is about to be replaced.
    compaction_gate: RwLock<()>,
}

impl DurableStore {
    /// Replay `wal_path` and start the writer task. Needs a tokio runtime.
    pub fn open(wal_path: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, records) = Wal::recover(wal_path)?;
        let replayed = records.len();
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let weeks = MemoryStore::new(notify);
        for (week, record) in Wal::latest_per_week(records) {
            for violation in record.schedule.check_invariants() {
                warn!("{week} v{}: {violation}", record.version);
            }
            weeks.restore(
                week,
                Snapshot {
                    version: record.version,
                    committed_at: Some(record.committed_at),
                    schedule: record.schedule,
                },
            );
        }
        info!("replayed {replayed} WAL records into {} weeks", weeks.week_ids().len());

        Ok(Self {
            weeks,
            wal_tx,
            compaction_gate: RwLock::new(()),
        })
    }

    async fn wal_append(&self, record: CommitRecord) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Rewrite the log with one record per week.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;
        let mut records = Vec::new();
        for week in self.weeks.week_ids() {
            let snap = self.weeks.read_latest(&week).await?;
            let Some(committed_at) = snap.committed_at else { continue };
            records.push(CommitRecord {
                week,
                version: snap.version,
                committed_at,
                schedule: snap.schedule,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn notify(&self) -> &NotifyHub {
        self.weeks.notify()
    }

    #[cfg(test)]
    async fn fail_next_flush(&self) {
        let _ = self.wal_tx.send(WalCommand::FailNextFlush).await;
    }
}

#[async_trait]
impl ScheduleStore for DurableStore {
    async fn read_latest(&self, week: &WeekId) -> Result<Snapshot, StoreError> {
        self.weeks.read_latest(week).await
    }

    async fn commit_if_unchanged(
        &self,
        week: &WeekId,
        expected_version: u64,
        schedule: WeekSchedule,
    ) -> Result<CommitOutcome, StoreError> {
        let _gate = self.compaction_gate.read().await;
        self.weeks
            .commit_with(week, expected_version, schedule, |next| async move {
                self.wal_append(CommitRecord {
                    week: week.clone(),
                    version: next.version,
                    committed_at: next.committed_at.unwrap_or_default(),
                    schedule: next.schedule.clone(),
                })
                .await
            })
            .await
    }

    fn subscribe(&self, week: &WeekId) -> broadcast::Receiver<Arc<Snapshot>> {
        self.weeks.subscribe(week)
    }
}
