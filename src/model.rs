use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::slot_key::{span_keys, SlotKey};

/// Unix milliseconds.
pub type Ms = i64;

pub type ReservationId = Ulid;

/// Every reservation occupies exactly this many slots. The field is kept on
/// [`Reservation`] so longer blocks stay representable in stored data.
pub const CANONICAL_DURATION: u32 = 1;

const PALETTE: [&str; 6] = ["blue", "emerald", "amber", "fuchsia", "cyan", "rose"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Day {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
}

impl Day {
    pub const ALL: [Day; 5] = [Day::Mon, Day::Tue, Day::Wed, Day::Thu, Day::Fri];

    pub fn as_str(self) -> &'static str {
        match self {
            Day::Mon => "Mon",
            Day::Tue => "Tue",
            Day::Wed => "Wed",
            Day::Thu => "Thu",
            Day::Fri => "Fri",
        }
    }

    /// Case-sensitive parse of the exact spelling produced by [`Day::as_str`].
    pub fn from_exact(s: &str) -> Option<Day> {
        Day::ALL.into_iter().find(|d| d.as_str() == s)
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque caller identity stamped on writes. Never validated here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One selectable (subject, cohort, owner) triple from the course catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub subject: String,
    pub cohort: String,
    pub owner: String,
}

impl CatalogEntry {
    pub fn new(subject: impl Into<String>, cohort: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            cohort: cohort.into(),
            owner: owner.into(),
        }
    }

    /// Composite key `"{subject}|{cohort}|{owner}"`.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.subject, self.cohort, self.owner)
    }
}

/// Display color for a subject: sum of UTF-16 code units, modulo the palette.
pub fn color_for_subject(subject: &str) -> &'static str {
    let sum: u64 = subject.encode_utf16().map(u64::from).sum();
    PALETTE[(sum % PALETTE.len() as u64) as usize]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub subject: String,
    pub cohort: String,
    pub owner: String,
    pub day: Day,
    pub start_slot: u32,
    pub duration_slots: u32,
    pub color: String,
    /// Identity of the last writer.
    pub uid: String,
    /// Commit time assigned by the store. `None` only inside an uncommitted
    /// draft, where it asks the store to stamp the record.
    pub updated_at: Option<Ms>,
}

impl Reservation {
    pub fn from_catalog(id: ReservationId, entry: &CatalogEntry, day: Day, start_slot: u32, caller: &CallerId) -> Self {
        Self {
            id,
            subject: entry.subject.clone(),
            cohort: entry.cohort.clone(),
            owner: entry.owner.clone(),
            day,
            start_slot,
            duration_slots: CANONICAL_DURATION,
            color: color_for_subject(&entry.subject).to_string(),
            uid: caller.as_str().to_string(),
            updated_at: None,
        }
    }

    /// Keys of every cell this reservation claims.
    pub fn cells(&self) -> impl Iterator<Item = SlotKey> {
        span_keys(self.day, self.start_slot, self.duration_slots)
    }
}

/// Document id of one calendar week: `"{lab}-w{NN}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekId(String);

impl WeekId {
    pub fn new(lab_id: &str, week: u32) -> Self {
        Self(format!("{lab_id}-w{week:02}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WeekId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the occupancy index says about one cell, checked against the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    Free,
    Live(ReservationId),
    /// Index points at a reservation that no longer exists.
    Dangling(ReservationId),
}

/// Full state of one week: occupancy index plus reservation records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekSchedule {
    pub slots: BTreeMap<SlotKey, ReservationId>,
    pub reservations: BTreeMap<ReservationId, Reservation>,
}

impl WeekSchedule {
    pub fn occupant(&self, key: &SlotKey) -> Occupant {
        match self.slots.get(key) {
            None => Occupant::Free,
            Some(id) if self.reservations.contains_key(id) => Occupant::Live(*id),
            Some(id) => Occupant::Dangling(*id),
        }
    }

    /// Drop the index entry at `key` if it still names `id`.
    pub fn release_if_held_by(&mut self, key: &SlotKey, id: &ReservationId) -> bool {
        if self.slots.get(key) == Some(id) {
            self.slots.remove(key);
            true
        } else {
            false
        }
    }

    /// Records ordered by day, then start slot.
    pub fn ordered(&self) -> Vec<&Reservation> {
        let mut out: Vec<&Reservation> = self.reservations.values().collect();
        out.sort_by_key(|r| (r.day, r.start_slot, r.id));
        out
    }

    pub fn dangling_keys(&self) -> Vec<SlotKey> {
        self.slots
            .iter()
            .filter(|(_, id)| !self.reservations.contains_key(id))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Every way this state departs from a clean, one-to-one index.
    pub fn check_invariants(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        let mut claimed: BTreeSet<SlotKey> = BTreeSet::new();

        for (key, id) in &self.slots {
            match self.reservations.get(id) {
                None => out.push(Violation::Dangling { key: key.clone(), id: *id }),
                Some(r) => {
                    if !r.cells().any(|c| &c == key) {
                        out.push(Violation::NotClaimed { key: key.clone(), id: *id });
                    }
                }
            }
        }

        for r in self.reservations.values() {
            for cell in r.cells() {
                if !claimed.insert(cell.clone()) {
                    out.push(Violation::Overlap { key: cell.clone(), id: r.id });
                }
                if self.slots.get(&cell) != Some(&r.id) {
                    out.push(Violation::Unindexed { key: cell, id: r.id });
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Dangling { key: SlotKey, id: ReservationId },
    NotClaimed { key: SlotKey, id: ReservationId },
    Overlap { key: SlotKey, id: ReservationId },
    Unindexed { key: SlotKey, id: ReservationId },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Dangling { key, id } => write!(f, "{key} points at missing reservation {id}"),
            Violation::NotClaimed { key, id } => write!(f, "{key} points at {id}, which does not claim it"),
            Violation::Overlap { key, id } => write!(f, "{key} claimed by {id} and another reservation"),
            Violation::Unindexed { key, id } => write!(f, "{key} claimed by {id} but not indexed to it"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CatalogEntry {
        CatalogEntry::new("ÁLGEBRA LINEAL", "1A", "ALMEIDA MURILLO WILMER FABRICIO")
    }

    fn placed(day: Day, slot: u32) -> Reservation {
        let mut r = Reservation::from_catalog(Ulid::new(), &entry(), day, slot, &CallerId::new("u1"));
        r.updated_at = Some(1);
        r
    }

    fn index(ws: &mut WeekSchedule, r: Reservation) {
        for cell in r.cells() {
            ws.slots.insert(cell, r.id);
        }
        ws.reservations.insert(r.id, r);
    }

    #[test]
    fn week_id_zero_padded() {
        assert_eq!(WeekId::new("lab-computo-uteq", 3).as_str(), "lab-computo-uteq-w03");
        assert_eq!(WeekId::new("lab", 18).as_str(), "lab-w18");
    }

    #[test]
    fn day_parse_is_case_sensitive() {
        assert_eq!(Day::from_exact("Tue"), Some(Day::Tue));
        assert_eq!(Day::from_exact("tue"), None);
        assert_eq!(Day::from_exact("Sat"), None);
    }

    #[test]
    fn catalog_key_is_composite() {
        assert_eq!(entry().key(), "ÁLGEBRA LINEAL|1A|ALMEIDA MURILLO WILMER FABRICIO");
    }

    #[test]
    fn color_is_deterministic_and_from_palette() {
        let a = color_for_subject("CIENCIA DE LOS MATERIALES");
        assert_eq!(a, color_for_subject("CIENCIA DE LOS MATERIALES"));
        assert!(PALETTE.contains(&a));
        // "A" = 65, 65 % 6 = 5
        assert_eq!(color_for_subject("A"), "rose");
        assert_eq!(color_for_subject(""), "blue");
    }

    #[test]
    fn from_catalog_copies_fields_verbatim() {
        let r = Reservation::from_catalog(Ulid::new(), &entry(), Day::Thu, 2, &CallerId::new("anon-7"));
        assert_eq!(r.subject, "ÁLGEBRA LINEAL");
        assert_eq!(r.cohort, "1A");
        assert_eq!(r.owner, "ALMEIDA MURILLO WILMER FABRICIO");
        assert_eq!(r.duration_slots, CANONICAL_DURATION);
        assert_eq!(r.uid, "anon-7");
        assert_eq!(r.updated_at, None);
        assert_eq!(r.cells().collect::<Vec<_>>(), vec![SlotKey::encode(Day::Thu, 2)]);
    }

    #[test]
    fn occupant_classification() {
        let mut ws = WeekSchedule::default();
        let r = placed(Day::Mon, 1);
        let live = r.id;
        index(&mut ws, r);
        let ghost = Ulid::new();
        ws.slots.insert(SlotKey::encode(Day::Mon, 2), ghost);

        assert_eq!(ws.occupant(&SlotKey::encode(Day::Mon, 1)), Occupant::Live(live));
        assert_eq!(ws.occupant(&SlotKey::encode(Day::Mon, 2)), Occupant::Dangling(ghost));
        assert_eq!(ws.occupant(&SlotKey::encode(Day::Mon, 3)), Occupant::Free);
        assert_eq!(ws.dangling_keys(), vec![SlotKey::encode(Day::Mon, 2)]);
    }

    #[test]
    fn clean_state_has_no_violations() {
        let mut ws = WeekSchedule::default();
        index(&mut ws, placed(Day::Mon, 1));
        index(&mut ws, placed(Day::Tue, 1));
        assert!(ws.check_invariants().is_empty());
    }

    #[test]
    fn violations_detected() {
        let mut ws = WeekSchedule::default();
        let a = placed(Day::Mon, 1);
        let b = placed(Day::Mon, 1);
        let a_id = a.id;
        ws.reservations.insert(a.id, a);
        ws.reservations.insert(b.id, b);
        ws.slots.insert(SlotKey::encode(Day::Mon, 1), a_id);
        ws.slots.insert(SlotKey::encode(Day::Fri, 9), a_id);

        let v = ws.check_invariants();
        assert!(v.iter().any(|x| matches!(x, Violation::Overlap { .. })));
        assert!(v.iter().any(|x| matches!(x, Violation::Unindexed { .. })));
        assert!(v.iter().any(|x| matches!(x, Violation::NotClaimed { id, .. } if *id == a_id)));
    }

    #[test]
    fn release_only_own_entries() {
        let mut ws = WeekSchedule::default();
        let key = SlotKey::encode(Day::Wed, 0);
        let owner = Ulid::new();
        ws.slots.insert(key.clone(), owner);
        assert!(!ws.release_if_held_by(&key, &Ulid::new()));
        assert!(ws.slots.contains_key(&key));
        assert!(ws.release_if_held_by(&key, &owner));
        assert!(!ws.slots.contains_key(&key));
    }

    #[test]
    fn ordered_by_day_then_slot() {
        let mut ws = WeekSchedule::default();
        index(&mut ws, placed(Day::Wed, 0));
        index(&mut ws, placed(Day::Mon, 5));
        index(&mut ws, placed(Day::Mon, 2));
        let order: Vec<_> = ws.ordered().iter().map(|r| (r.day, r.start_slot)).collect();
        assert_eq!(order, vec![(Day::Mon, 2), (Day::Mon, 5), (Day::Wed, 0)]);
    }

    #[test]
    fn schedule_bincode_roundtrip() {
        let mut ws = WeekSchedule::default();
        index(&mut ws, placed(Day::Fri, 4));
        let bytes = bincode::serialize(&ws).unwrap();
        let decoded: WeekSchedule = bincode::deserialize(&bytes).unwrap();
        assert_eq!(ws, decoded);
    }
}
