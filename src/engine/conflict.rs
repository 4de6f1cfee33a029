use crate::model::*;
use crate::slot_key::{span_keys, SlotKey};

use super::EngineError;

/// Bounds-check a block of `CANONICAL_DURATION` slots starting at `start` and
/// return its keys.
pub(crate) fn target_keys(day: Day, start: i64, slot_count: u32) -> Result<Vec<SlotKey>, EngineError> {
    let end = start.checked_add(i64::from(CANONICAL_DURATION));
    match end {
        Some(end) if start >= 0 && end <= i64::from(slot_count) => {
            Ok(span_keys(day, start as u32, CANONICAL_DURATION).collect())
        }
        _ => Err(EngineError::OutOfRange { day, start, slot_count }),
    }
}

/// Drop occupancy entries at `keys` whose reservation no longer exists.
/// Returns how many were removed.
pub(crate) fn heal_dangling(ws: &mut WeekSchedule, keys: &[SlotKey]) -> usize {
    let mut healed = 0;
    for key in keys {
        if let Occupant::Dangling(_) = ws.occupant(key) {
            ws.slots.remove(key);
            healed += 1;
        }
    }
    healed
}

/// First key in `keys` held by a live reservation other than `except`.
pub(crate) fn first_live_holder(
    ws: &WeekSchedule,
    keys: &[SlotKey],
    except: Option<&ReservationId>,
) -> Option<(SlotKey, ReservationId)> {
    keys.iter().find_map(|key| match ws.occupant(key) {
        Occupant::Live(holder) if Some(&holder) != except => Some((key.clone(), holder)),
        _ => None,
    })
}
