//! The attendance desk: latest observation plus the ledger behind one lock.
//!
//! The capture loop writes observations, web handlers read them and mark
//! attendance. Holding both under a single mutex means a mark always sees a
//! whole observation and two concurrent marks for the same person and slot
//! cannot both pass the duplicate check.

use crate::ledger::{read_ledger_file, read_ledger_text, AttendanceRecord, Ledger, LedgerError};
use crate::slots::{AttendanceStatus, Slot, SlotPolicy};
use crate::types::{Identity, Observation};
use chrono::{NaiveDateTime, Timelike};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarkError {
    #[error("No student identified. Please ensure your face is recognized.")]
    NoIdentity,
    #[error("Outside lecture hours. Attendance cannot be marked.")]
    OutsideLectureHours,
    #[error("Attendance already marked for {name} in {slot}.")]
    AlreadyMarked { name: String, slot: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl MarkError {
    /// Whether this is a user-facing rejection rather than a failure.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, MarkError::Ledger(_))
    }
}

struct DeskState {
    latest: Observation,
    ledger: Ledger,
    last_record: Option<AttendanceRecord>,
    announced_late: Option<AttendanceRecord>,
}

/// Latest observation and ledger behind one lock.
///
/// Reads of the ledger file go straight to disk without taking the lock;
/// a row being appended concurrently is either complete or skipped.
pub struct AttendanceDesk {
    policy: SlotPolicy,
    ledger_path: PathBuf,
    state: Mutex<DeskState>,
}

impl AttendanceDesk {
    pub fn new(ledger: Ledger) -> Result<Self, LedgerError> {
        let last_record = ledger.read_all()?.pop();
        Ok(Self {
            policy: ledger.policy().clone(),
            ledger_path: ledger.path().to_path_buf(),
            state: Mutex::new(DeskState {
                latest: Observation::unidentified(),
                ledger,
                last_record,
                announced_late: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, DeskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the latest observation.
    pub fn observe(&self, observation: Observation) {
        self.state().latest = observation;
    }

    pub fn latest(&self) -> Observation {
        self.state().latest.clone()
    }

    pub fn latest_identity(&self) -> Identity {
        self.state().latest.identity.clone()
    }

    pub fn policy(&self) -> &SlotPolicy {
        &self.policy
    }

    /// Mark whoever the capture loop saw last.
    pub fn mark(&self, now: NaiveDateTime) -> Result<AttendanceRecord, MarkError> {
        let mut state = self.state();
        let identity = state.latest.identity.clone();
        Self::mark_locked(&mut state, &identity, now)
    }

    /// Mark a specific identity.
    pub fn mark_identity(
        &self,
        identity: &Identity,
        now: NaiveDateTime,
    ) -> Result<AttendanceRecord, MarkError> {
        Self::mark_locked(&mut self.state(), identity, now)
    }

    fn mark_locked(
        state: &mut DeskState,
        identity: &Identity,
        now: NaiveDateTime,
    ) -> Result<AttendanceRecord, MarkError> {
        let Identity::Known(name) = identity else {
            return Err(MarkError::NoIdentity);
        };
        // Ledger rows carry whole seconds.
        let now = now.with_nanosecond(0).unwrap_or(now);
        let policy = state.ledger.policy();
        let slot = policy.slot_for(now).ok_or(MarkError::OutsideLectureHours)?;

        if state.ledger.is_marked(now.date(), name, slot) {
            return Err(MarkError::AlreadyMarked {
                name: name.clone(),
                slot: policy.label(slot),
            });
        }

        let record = AttendanceRecord {
            name: name.clone(),
            timestamp: now,
            status: policy.status(now, slot),
            slot,
        };
        state.ledger.append(&record)?;
        state.last_record = Some(record.clone());

        tracing::info!(
            name = %record.name,
            slot = %record.slot,
            status = %record.status,
            "attendance marked"
        );
        Ok(record)
    }

    pub fn records(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        read_ledger_file(&self.ledger_path)
    }

    /// Raw ledger text for display or download.
    pub fn read_ledger(&self) -> Result<String, LedgerError> {
        read_ledger_text(&self.ledger_path)
    }

    #[cfg(test)]
    fn is_marked(&self, record: &AttendanceRecord) -> bool {
        self.state().ledger.is_marked(record.date(), &record.name, record.slot)
    }

    /// True once for each new late record made after its slot's alert time,
    /// while that slot is still running.
    pub fn check_late(&self, now: NaiveDateTime) -> bool {
        let policy = &self.policy;
        let Some(slot) = policy.slot_for(now) else {
            return false;
        };
        let Some(alert_after) = policy.window(slot).alert_after else {
            return false;
        };
        if now.time() < alert_after {
            return false;
        }

        let mut state = self.state();
        let fresh = match &state.last_record {
            Some(last) if last.status == AttendanceStatus::Late => {
                state.announced_late.as_ref() != Some(last)
            }
            _ => false,
        };
        if fresh {
            state.announced_late = state.last_record.clone();
        }
        fresh
    }

    /// Number of `records` that are late and were marked after their slot's
    /// alert time.
    pub fn latecomer_count(&self, records: &[AttendanceRecord]) -> usize {
        records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Late)
            .filter(|r| {
                let window = self.policy.window(r.slot);
                let t = r.timestamp.time();
                window.alert_after.is_some_and(|a| a <= t && t <= window.end)
            })
            .count()
    }

    pub fn slot_for(&self, now: NaiveDateTime) -> Option<Slot> {
        self.policy.slot_for(now)
    }
}
