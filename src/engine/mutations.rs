use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{first_live_holder, heal_dangling, target_keys};
use super::{EngineError, Scheduler};

// ── Transaction bodies ──────────────────────────────────────────
//
// Pure functions of (draft, arguments). The transaction driver may run them
// several times against successive snapshots. Place and Move return how many
// dangling entries they repaired.

pub(crate) fn place_body(
    ws: &mut WeekSchedule,
    slot_count: u32,
    id: ReservationId,
    entry: &CatalogEntry,
    caller: &CallerId,
    day: Day,
    start: i64,
) -> Result<usize, EngineError> {
    let keys = target_keys(day, start, slot_count)?;
    let healed = heal_dangling(ws, &keys);
    if let Some((key, holder)) = first_live_holder(ws, &keys, None) {
        return Err(EngineError::SlotOccupied { key, holder });
    }

    let reservation = Reservation::from_catalog(id, entry, day, start as u32, caller);
    for key in keys {
        ws.slots.insert(key, id);
    }
    ws.reservations.insert(id, reservation);
    Ok(healed)
}

pub(crate) fn move_body(
    ws: &mut WeekSchedule,
    slot_count: u32,
    id: ReservationId,
    caller: &CallerId,
    day: Day,
    start: i64,
) -> Result<usize, EngineError> {
    let source: Vec<_> = match ws.reservations.get(&id) {
        Some(current) => current.cells().collect(),
        None => return Err(EngineError::NotFound(id)),
    };
    let keys = target_keys(day, start, slot_count)?;
    let healed = heal_dangling(ws, &keys);
    if let Some((key, holder)) = first_live_holder(ws, &keys, Some(&id)) {
        return Err(EngineError::SlotCollision { key, holder });
    }

    for key in &source {
        ws.release_if_held_by(key, &id);
    }
    for key in keys {
        ws.slots.insert(key, id);
    }
    if let Some(r) = ws.reservations.get_mut(&id) {
        r.day = day;
        r.start_slot = start as u32;
        r.duration_slots = CANONICAL_DURATION;
        r.uid = caller.as_str().to_string();
        r.updated_at = None;
    }
    Ok(healed)
}

/// `false` when `id` is already gone.
pub(crate) fn delete_body(ws: &mut WeekSchedule, id: ReservationId) -> bool {
    let Some(current) = ws.reservations.remove(&id) else {
        return false;
    };
    for key in current.cells() {
        ws.release_if_held_by(&key, &id);
    }
    true
}

impl Scheduler {
    /// Create a reservation for `entry` at `(day, start)`.
    pub async fn place(
        &self,
        week: &WeekId,
        caller: &CallerId,
        entry: &CatalogEntry,
        day: Day,
        start: i64,
    ) -> Result<Reservation, EngineError> {
        let id = Ulid::new();
        let slot_count = self.grid.slot_count();
        let mut healed = 0;
        let snapshot = self
            .run_transaction(week, "place", |ws| {
                healed = place_body(ws, slot_count, id, entry, caller, day, start)?;
                Ok(())
            })
            .await?;
        self.record_repairs(week, healed);
        info!("{week}: placed {id} ({}) at {day}|{start} by {caller}", entry.subject);
        committed_reservation(&snapshot.schedule, id)
    }

    /// Relocate `id` to `(day, start)`. Moving onto its own cells succeeds and
    /// refreshes the writer and timestamp.
    pub async fn move_reservation(
        &self,
        week: &WeekId,
        caller: &CallerId,
        id: ReservationId,
        day: Day,
        start: i64,
    ) -> Result<Reservation, EngineError> {
        let slot_count = self.grid.slot_count();
        let mut healed = 0;
        let snapshot = self
            .run_transaction(week, "move", |ws| {
                healed = move_body(ws, slot_count, id, caller, day, start)?;
                Ok(())
            })
            .await?;
        self.record_repairs(week, healed);
        info!("{week}: moved {id} to {day}|{start} by {caller}");
        committed_reservation(&snapshot.schedule, id)
    }

    /// Remove `id`. Deleting a missing reservation succeeds without writing;
    /// the flag says whether anything was removed.
    pub async fn delete(&self, week: &WeekId, id: ReservationId) -> Result<bool, EngineError> {
        let mut removed = false;
        self.run_transaction(week, "delete", |ws| {
            removed = delete_body(ws, id);
            Ok(())
        })
        .await?;
        if removed {
            info!("{week}: deleted {id}");
        }
        Ok(removed)
    }

    /// Count repairs made by the attempt that committed.
    fn record_repairs(&self, week: &WeekId, healed: usize) {
        if healed > 0 {
            debug!("{week}: repaired {healed} dangling slot entries");
            metrics::counter!(crate::observability::DANGLING_REPAIRED_TOTAL).increment(healed as u64);
        }
    }
}

fn committed_reservation(ws: &WeekSchedule, id: ReservationId) -> Result<Reservation, EngineError> {
    ws.reservations.get(&id).cloned().ok_or(EngineError::NotFound(id))
}
