use std::fmt;

/// Minutes since midnight.
pub type Minutes = u32;

/// Slot start times covering `[start, end)` in steps of `duration`.
///
/// Yields `ceil((end - start) / duration)` items. Callers pass `start < end`
/// and `duration > 0`.
pub fn slot_starts(start: Minutes, end: Minutes, duration: Minutes) -> impl Iterator<Item = Minutes> {
    debug_assert!(duration > 0, "slot duration must be positive");
    (start..end).step_by(duration as usize)
}

/// Shape of one day's column on the weekly grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub day_start: Minutes,
    pub day_end: Minutes,
    pub slot_minutes: Minutes,
}

impl GridShape {
    pub fn new(day_start: Minutes, day_end: Minutes, slot_minutes: Minutes) -> Result<Self, GridError> {
        if slot_minutes == 0 {
            return Err(GridError::ZeroSlot);
        }
        if day_start >= day_end {
            return Err(GridError::EmptyDay { day_start, day_end });
        }
        if day_end > 24 * 60 {
            return Err(GridError::PastMidnight(day_end));
        }
        Ok(Self { day_start, day_end, slot_minutes })
    }

    pub fn slot_count(&self) -> u32 {
        (self.day_end - self.day_start).div_ceil(self.slot_minutes)
    }

    pub fn slot_starts(&self) -> impl Iterator<Item = Minutes> {
        slot_starts(self.day_start, self.day_end, self.slot_minutes)
    }

    /// `HH:MM` label per slot.
    pub fn labels(&self) -> Vec<String> {
        self.slot_starts().map(format_hhmm).collect()
    }

    /// Slot labels followed by the closing time, for drawing row boundaries.
    pub fn time_labels(&self) -> Vec<String> {
        let mut labels = self.labels();
        labels.push(format_hhmm(self.day_end));
        labels
    }

    /// `(start, end)` of a slot, with the last slot clipped to `day_end`.
    pub fn slot_bounds(&self, slot: u32) -> Option<(Minutes, Minutes)> {
        if slot >= self.slot_count() {
            return None;
        }
        let start = self.day_start + slot * self.slot_minutes;
        let end = (start + self.slot_minutes).min(self.day_end);
        Some((start, end))
    }
}

pub fn format_hhmm(minutes: Minutes) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn parse_hhmm(s: &str) -> Result<Minutes, GridError> {
    let bad = || GridError::BadTime(s.to_string());
    let (h, m) = s.split_once(':').ok_or_else(bad)?;
    let h: Minutes = h.parse().map_err(|_| bad())?;
    let m: Minutes = m.parse().map_err(|_| bad())?;
    if h > 24 || m > 59 || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

#[derive(Debug, PartialEq, Eq)]
pub enum GridError {
    ZeroSlot,
    EmptyDay { day_start: Minutes, day_end: Minutes },
    PastMidnight(Minutes),
    BadTime(String),
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridError::ZeroSlot => write!(f, "slot duration must be positive"),
            GridError::EmptyDay { day_start, day_end } => write!(
                f,
                "day start {} must be before day end {}",
                format_hhmm(*day_start),
                format_hhmm(*day_end)
            ),
            GridError::PastMidnight(end) => write!(f, "day end {end} is past midnight"),
            GridError::BadTime(s) => write!(f, "bad time of day: {s:?} (expected HH:MM)"),
        }
    }
}

impl std::error::Error for GridError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab_day() -> GridShape {
        GridShape::new(7 * 60 + 30, 17 * 60 + 30, 60).unwrap()
    }

    #[test]
    fn lab_day_has_ten_slots() {
        let grid = lab_day();
        assert_eq!(grid.slot_count(), 10);
        let labels = grid.labels();
        assert_eq!(labels.first().map(String::as_str), Some("07:30"));
        assert_eq!(labels.last().map(String::as_str), Some("16:30"));
        assert_eq!(grid.time_labels().len(), 11);
        assert_eq!(grid.time_labels().last().map(String::as_str), Some("17:30"));
    }

    #[test]
    fn length_is_ceiling() {
        // 100 minutes in 30 minute steps -> 4 slots, last one short
        let starts: Vec<_> = slot_starts(0, 100, 30).collect();
        assert_eq!(starts, vec![0, 30, 60, 90]);
        let grid = GridShape::new(0, 100, 30).unwrap();
        assert_eq!(grid.slot_count(), 4);
        assert_eq!(grid.slot_bounds(3), Some((90, 100)));
        assert_eq!(grid.slot_bounds(4), None);
    }

    #[test]
    fn exact_division() {
        assert_eq!(slot_starts(60, 180, 60).count(), 2);
    }

    #[test]
    fn iterator_is_consumed_once() {
        let mut it = slot_starts(0, 120, 60);
        assert_eq!(it.next(), Some(0));
        assert_eq!(it.next(), Some(60));
        assert_eq!(it.next(), None);
        assert_eq!(it.next(), None);
    }

    #[test]
    fn hhmm_roundtrip_and_errors() {
        assert_eq!(parse_hhmm("07:30"), Ok(450));
        assert_eq!(format_hhmm(450), "07:30");
        assert_eq!(parse_hhmm("24:00"), Ok(1440));
        assert!(parse_hhmm("7h30").is_err());
        assert!(parse_hhmm("12:60").is_err());
        assert!(parse_hhmm("25:00").is_err());
    }

    #[test]
    fn invalid_shapes_rejected() {
        assert_eq!(GridShape::new(600, 600, 60), Err(GridError::EmptyDay { day_start: 600, day_end: 600 }));
        assert_eq!(GridShape::new(0, 600, 0), Err(GridError::ZeroSlot));
        assert_eq!(GridShape::new(0, 1500, 60), Err(GridError::PastMidnight(1500)));
    }
}
