//! Lecture slot policy: which slot a moment falls into and whether it is on time.

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SlotError {
    #[error("{slot}: cutoff {cutoff} must lie within {start}..={end}")]
    CutoffOutsideWindow {
        slot: Slot,
        start: NaiveTime,
        end: NaiveTime,
        cutoff: NaiveTime,
    },
    #[error("{slot}: start {start} is after end {end}")]
    InvertedWindow {
        slot: Slot,
        start: NaiveTime,
        end: NaiveTime,
    },
    #[error("slot windows overlap")]
    Overlap,
    #[error("invalid clock time {0:?} (expected HH:MM or HH:MM:SS)")]
    BadClock(String),
}

/// One of the two configured lecture slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    Slot1,
    Slot2,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::Slot1, Slot::Slot2];

    pub fn number(self) -> u8 {
        match self {
            Slot::Slot1 => 1,
            Slot::Slot2 => 2,
        }
    }

    /// Recover a slot from a ledger label such as `Slot 2 (11:30-14:30)`.
    pub fn from_label(label: &str) -> Option<Slot> {
        let rest = label.trim().strip_prefix("Slot")?.trim_start();
        match rest.chars().next()? {
            '1' => Some(Slot::Slot1),
            '2' => Some(Slot::Slot2),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot {}", self.number())
    }
}

/// Verdict for an attendance mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    OnTime,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::OnTime => "On Time",
            AttendanceStatus::Late => "Late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "On Time" => Some(AttendanceStatus::OnTime),
            "Late" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-of-day window for one lecture slot. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotWindow {
    #[serde(with = "clock")]
    pub start: NaiveTime,
    #[serde(with = "clock")]
    pub end: NaiveTime,
    /// Last moment that still counts as on time.
    #[serde(with = "clock")]
    pub on_time_until: NaiveTime,
    /// Marks after this time raise the dashboard late alert.
    #[serde(default, with = "clock::option")]
    pub alert_after: Option<NaiveTime>,
}

impl SlotWindow {
    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t <= self.end
    }

    fn validate(&self, slot: Slot) -> Result<(), SlotError> {
        if self.start > self.end {
            return Err(SlotError::InvertedWindow {
                slot,
                start: self.start,
                end: self.end,
            });
        }
        if !self.contains(self.on_time_until) {
            return Err(SlotError::CutoffOutsideWindow {
                slot,
                start: self.start,
                end: self.end,
                cutoff: self.on_time_until,
            });
        }
        Ok(())
    }
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

#[derive(Deserialize)]
struct SlotPolicyConfig {
    slot1: SlotWindow,
    slot2: SlotWindow,
}

/// The two lecture windows and their on-time cutoffs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "SlotPolicyConfig")]
pub struct SlotPolicy {
    slot1: SlotWindow,
    slot2: SlotWindow,
}

impl TryFrom<SlotPolicyConfig> for SlotPolicy {
    type Error = SlotError;

    fn try_from(cfg: SlotPolicyConfig) -> Result<Self, Self::Error> {
        SlotPolicy::new(cfg.slot1, cfg.slot2)
    }
}

impl Default for SlotPolicy {
    /// Slot 1 08:00–11:00 (on time until 08:05), Slot 2 11:30–14:30
    /// (on time until 11:35). Late alerts fire for Slot 1 from 09:30.
    fn default() -> Self {
        Self {
            slot1: SlotWindow {
                start: hm(8, 0),
                end: hm(11, 0),
                on_time_until: hm(8, 5),
                alert_after: Some(hm(9, 30)),
            },
            slot2: SlotWindow {
                start: hm(11, 30),
                end: hm(14, 30),
                on_time_until: hm(11, 35),
                alert_after: None,
            },
        }
    }
}

impl SlotPolicy {
    pub fn new(slot1: SlotWindow, slot2: SlotWindow) -> Result<Self, SlotError> {
        slot1.validate(Slot::Slot1)?;
        slot2.validate(Slot::Slot2)?;
        if slot1.start <= slot2.end && slot2.start <= slot1.end {
            return Err(SlotError::Overlap);
        }
        Ok(Self { slot1, slot2 })
    }

    pub fn window(&self, slot: Slot) -> &SlotWindow {
        match slot {
            Slot::Slot1 => &self.slot1,
            Slot::Slot2 => &self.slot2,
        }
    }

    /// Slot containing `at`, or `None` outside lecture hours.
    pub fn slot_for(&self, at: NaiveDateTime) -> Option<Slot> {
        let t = at.time();
        Slot::ALL.into_iter().find(|&s| self.window(s).contains(t))
    }

    pub fn is_on_time(&self, at: NaiveDateTime, slot: Slot) -> bool {
        at.time() <= self.window(slot).on_time_until
    }

    pub fn status(&self, at: NaiveDateTime, slot: Slot) -> AttendanceStatus {
        if self.is_on_time(at, slot) {
            AttendanceStatus::OnTime
        } else {
            AttendanceStatus::Late
        }
    }

    /// Human-readable label written to the ledger, e.g. `Slot 1 (8:00-11:00)`.
    pub fn label(&self, slot: Slot) -> String {
        let w = self.window(slot);
        format!(
            "{slot} ({}-{})",
            w.start.format("%-H:%M"),
            w.end.format("%-H:%M")
        )
    }
}

/// `HH:MM[:SS]` serde format for [`NaiveTime`].
pub mod clock {
    use super::SlotError;
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Result<NaiveTime, SlotError> {
        let s = s.trim();
        NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .map_err(|_| SlotError::BadClock(s.to_string()))
    }

    pub fn serialize<S: Serializer>(t: &NaiveTime, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(&t.format("%H:%M:%S"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(de)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(t: &Option<NaiveTime>, ser: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => super::serialize(t, ser),
                None => ser.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<NaiveTime>, D::Error> {
            Option::<String>::deserialize(de)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_slot_boundaries() {
        let p = SlotPolicy::default();
        assert_eq!(p.slot_for(at(7, 59, 0)), None);
        assert_eq!(p.slot_for(at(8, 0, 0)), Some(Slot::Slot1));
        assert_eq!(p.slot_for(at(11, 0, 0)), Some(Slot::Slot1));
        assert_eq!(p.slot_for(at(11, 0, 1)), None);
        assert_eq!(p.slot_for(at(11, 29, 0)), None);
        assert_eq!(p.slot_for(at(11, 30, 0)), Some(Slot::Slot2));
        assert_eq!(p.slot_for(at(14, 30, 0)), Some(Slot::Slot2));
        assert_eq!(p.slot_for(at(14, 31, 0)), None);
    }

    #[test]
    fn test_on_time_cutoff_inclusive() {
        let p = SlotPolicy::default();
        assert!(p.is_on_time(at(8, 5, 0), Slot::Slot1));
        assert!(!p.is_on_time(at(8, 5, 1), Slot::Slot1));
        assert!(p.is_on_time(at(11, 35, 0), Slot::Slot2));
        assert!(!p.is_on_time(at(11, 35, 1), Slot::Slot2));
        assert_eq!(p.status(at(9, 0, 0), Slot::Slot1), AttendanceStatus::Late);
    }

    #[test]
    fn test_labels_round_trip_to_slot() {
        let p = SlotPolicy::default();
        assert_eq!(p.label(Slot::Slot1), "Slot 1 (8:00-11:00)");
        assert_eq!(p.label(Slot::Slot2), "Slot 2 (11:30-14:30)");
        for slot in Slot::ALL {
            assert_eq!(Slot::from_label(&p.label(slot)), Some(slot));
        }
        assert_eq!(Slot::from_label("Lab"), None);
    }

    #[test]
    fn test_rejects_cutoff_outside_window() {
        let mut w = *SlotPolicy::default().window(Slot::Slot1);
        w.on_time_until = hm(7, 0);
        let err = SlotPolicy::new(w, *SlotPolicy::default().window(Slot::Slot2)).unwrap_err();
        assert!(matches!(err, SlotError::CutoffOutsideWindow { slot: Slot::Slot1, .. }));
    }

    #[test]
    fn test_rejects_overlap() {
        let d = SlotPolicy::default();
        let mut w2 = *d.window(Slot::Slot2);
        w2.start = hm(10, 0);
        w2.on_time_until = hm(10, 5);
        assert_eq!(SlotPolicy::new(*d.window(Slot::Slot1), w2), Err(SlotError::Overlap));
    }

    #[test]
    fn test_clock_parse() {
        assert_eq!(clock::parse("08:05").unwrap(), hm(8, 5));
        assert_eq!(clock::parse("08:05:30").unwrap(), NaiveTime::from_hms_opt(8, 5, 30).unwrap());
        assert!(clock::parse("8 o'clock").is_err());
    }

    #[test]
    fn test_status_text() {
        assert_eq!(AttendanceStatus::parse("On Time"), Some(AttendanceStatus::OnTime));
        assert_eq!(AttendanceStatus::parse("Late"), Some(AttendanceStatus::Late));
        assert_eq!(AttendanceStatus::parse("Absent"), None);
    }
}
