mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::grid::GridShape;
use crate::model::*;
use crate::store::{CommitOutcome, ScheduleStore, Snapshot};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Conflict-resolution engine for one lab's weekly grid.
///
/// Holds no schedule state of its own: every operation reads the latest
/// snapshot from the store, computes the successor and commits it only if
/// nobody else committed in between.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    grid: GridShape,
    max_attempts: u32,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, grid: GridShape) -> Self {
        Self {
            store,
            grid,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn grid(&self) -> &GridShape {
        &self.grid
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Optimistic read-compute-commit loop.
    ///
    /// `body` edits a private copy of the latest schedule. An error aborts with
    /// nothing written. A body that leaves the copy unchanged commits nothing.
    /// A lost race re-runs `body` on the newer state.
    pub(crate) async fn run_transaction<F>(
        &self,
        week: &WeekId,
        op: &'static str,
        mut body: F,
    ) -> Result<Arc<Snapshot>, EngineError>
    where
        F: FnMut(&mut WeekSchedule) -> Result<(), EngineError> + Send,
    {
        let started = Instant::now();
        let result = self.transact(week, op, &mut body).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(crate::observability::OPERATIONS_TOTAL, "op" => op, "outcome" => outcome)
            .increment(1);
        metrics::histogram!(crate::observability::OPERATION_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn transact<F>(&self, week: &WeekId, op: &'static str, body: &mut F) -> Result<Arc<Snapshot>, EngineError>
    where
        F: FnMut(&mut WeekSchedule) -> Result<(), EngineError> + Send,
    {
        for attempt in 1..=self.max_attempts {
            let snapshot = self.store.read_latest(week).await?;
            let mut draft = snapshot.schedule.clone();
            body(&mut draft)?;
            if draft == snapshot.schedule {
                return Ok(Arc::new(snapshot));
            }

            match self
                .store
                .commit_if_unchanged(week, snapshot.version, draft)
                .await?
            {
                CommitOutcome::Committed(committed) => return Ok(committed),
                CommitOutcome::Conflict { current_version } => {
                    debug!(
                        "{week}: {op} lost race at v{} (now v{current_version}), attempt {attempt}/{}",
                        snapshot.version, self.max_attempts
                    );
                    metrics::counter!(crate::observability::TRANSACTION_CONFLICTS_TOTAL, "op" => op)
                        .increment(1);
                }
            }
        }
        Err(EngineError::Contention {
            attempts: self.max_attempts,
        })
    }
}
