use crate::model::{Day, ReservationId};
use crate::slot_key::SlotKey;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    OutOfRange {
        day: Day,
        start: i64,
        slot_count: u32,
    },
    /// Place targeted a cell held by a live reservation.
    SlotOccupied {
        key: SlotKey,
        holder: ReservationId,
    },
    /// Move targeted a cell held by a different live reservation.
    SlotCollision {
        key: SlotKey,
        holder: ReservationId,
    },
    NotFound(ReservationId),
    /// Lost the optimistic race on every attempt.
    Contention {
        attempts: u32,
    },
    Store(StoreError),
}

impl EngineError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::OutOfRange { .. } => "out_of_range",
            EngineError::SlotOccupied { .. } => "slot_occupied",
            EngineError::SlotCollision { .. } => "slot_collision",
            EngineError::NotFound(_) => "not_found",
            EngineError::Contention { .. } => "contention",
            EngineError::Store(_) => "store",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::OutOfRange { day, start, slot_count } => {
                write!(f, "slot {start} on {day} is outside the grid (0..{slot_count})")
            }
            EngineError::SlotOccupied { key, holder } => {
                write!(f, "slot {key} is already occupied by {holder}")
            }
            EngineError::SlotCollision { key, holder } => {
                write!(f, "slot {key} collides with reservation {holder}")
            }
            EngineError::NotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::Contention { attempts } => {
                write!(f, "transaction aborted after {attempts} conflicting attempts")
            }
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}
