use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::Day;

const SEPARATOR: char = '|';

/// Flat occupancy-map key for one grid cell: `"{day}|{slot}"`.
///
/// Compared byte for byte. `"mon|3"` and `"Mon|03"` are different keys from
/// `"Mon|3"` and neither decodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(String);

impl SlotKey {
    pub fn encode(day: Day, slot: u32) -> Self {
        Self(format!("{}{SEPARATOR}{slot}", day.as_str()))
    }

    /// Inverse of [`SlotKey::encode`]. `None` for anything `encode` could not
    /// have produced.
    pub fn decode(&self) -> Option<(Day, u32)> {
        let (day, slot) = self.0.split_once(SEPARATOR)?;
        let day = Day::from_exact(day)?;
        // Reject "+3", "03" and the like so decode stays injective.
        if slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if slot.len() > 1 && slot.starts_with('0') {
            return None;
        }
        let slot = slot.parse().ok()?;
        Some((day, slot))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a raw key as read from an untrusted source. No validation.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keys covered by a block of `duration` slots starting at `start`.
pub fn span_keys(day: Day, start: u32, duration: u32) -> impl Iterator<Item = SlotKey> {
    (start..start + duration).map(move |slot| SlotKey::encode(day, slot))
}
