//! Append-only attendance ledger stored as a comma-separated text file.
//!
//! The file starts with the header `Name,Timestamp,Status,Lecture Slot` and
//! gains one row per mark. Rows are never rewritten. The in-memory
//! [`SuppressionIndex`] is derived from the file on open and kept in step
//! with every append.

use crate::slots::{AttendanceStatus, Slot, SlotPolicy};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LEDGER_HEADER: [&str; 4] = ["Name", "Timestamp", "Status", "Lecture Slot"];
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub status: AttendanceStatus,
    pub slot: Slot,
}

impl AttendanceRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    fn to_row(&self, policy: &SlotPolicy) -> String {
        let mut row = String::new();
        let ts = self.timestamp.format(TIMESTAMP_FORMAT).to_string();
        let label = policy.label(self.slot);
        let fields = [
            self.name.as_str(),
            ts.as_str(),
            self.status.as_str(),
            label.as_str(),
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                row.push(',');
            }
            push_field(&mut row, field);
        }
        row.push('\n');
        row
    }

    fn from_fields(fields: &[String]) -> Option<Self> {
        let [name, ts, status, slot] = fields else {
            return None;
        };
        Some(Self {
            name: name.clone(),
            timestamp: NaiveDateTime::parse_from_str(ts.trim(), TIMESTAMP_FORMAT).ok()?,
            status: AttendanceStatus::parse(status)?,
            slot: Slot::from_label(slot)?,
        })
    }
}

/// date → name → slots already logged that day.
#[derive(Debug, Default, Clone)]
pub struct SuppressionIndex {
    days: BTreeMap<NaiveDate, HashMap<String, HashSet<Slot>>>,
}

impl SuppressionIndex {
    pub fn contains(&self, date: NaiveDate, name: &str, slot: Slot) -> bool {
        self.days
            .get(&date)
            .and_then(|names| names.get(name))
            .is_some_and(|slots| slots.contains(&slot))
    }

    pub fn insert(&mut self, record: &AttendanceRecord) {
        self.days
            .entry(record.date())
            .or_default()
            .entry(record.name.clone())
            .or_default()
            .insert(record.slot);
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a AttendanceRecord>) -> Self {
        let mut index = Self::default();
        for record in records {
            index.insert(record);
        }
        index
    }
}

/// Where ledger rows are written. Lets a failed append be undone.
trait RowSink: Write {
    fn len(&self) -> io::Result<u64>;
    fn sync(&self) -> io::Result<()>;
    fn truncate(&self, len: u64) -> io::Result<()>;
}

impl RowSink for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write `row` and flush it to disk, or leave the sink at its old length.
fn append_row(sink: &mut impl RowSink, row: &[u8]) -> io::Result<()> {
    let len = sink.len()?;
    let written = sink.write_all(row).and_then(|()| sink.sync());
    if let Err(e) = written {
        if let Err(rollback) = sink.truncate(len) {
            tracing::error!(error = %rollback, "failed to roll back partial ledger row");
        }
        return Err(e);
    }
    Ok(())
}

/// Handle to the ledger file plus its derived suppression index.
///
/// The file is reopened for every append, so replacing or removing it
/// while the ledger is open surfaces as an append error.
pub struct Ledger {
    path: PathBuf,
    policy: SlotPolicy,
    index: SuppressionIndex,
}

impl Ledger {
    /// Open (or create) the ledger at `path` and rebuild the suppression index
    /// from the rows already in it.
    pub fn open(path: impl AsRef<Path>, policy: SlotPolicy) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_err)?;

        let mut text = String::new();
        file.read_to_string(&mut text).map_err(io_err)?;

        if text.is_empty() {
            let mut header = LEDGER_HEADER.join(",");
            header.push('\n');
            file.write_all(header.as_bytes()).map_err(io_err)?;
            file.sync_data().map_err(io_err)?;
        } else if !text.ends_with('\n') {
            // Hand-edited file without a trailing newline.
            file.write_all(b"\n").map_err(io_err)?;
        }

        let records = parse_records(&text);
        let index = SuppressionIndex::from_records(&records);

        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "opened attendance ledger"
        );

        Ok(Self {
            path,
            policy,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &SlotPolicy {
        &self.policy
    }

    pub fn is_marked(&self, date: NaiveDate, name: &str, slot: Slot) -> bool {
        self.index.contains(date, name, slot)
    }

    /// Durably append one row and record it in the suppression index.
    ///
    /// On failure the file is truncated back to its previous length and the
    /// index is left untouched.
    pub fn append(&mut self, record: &AttendanceRecord) -> Result<(), LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        append_row(&mut file, record.to_row(&self.policy).as_bytes()).map_err(io_err)?;

        self.index.insert(record);
        tracing::debug!(name = %record.name, slot = %record.slot, "ledger row appended");
        Ok(())
    }

    /// All well-formed records, in file order.
    pub fn read_all(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        Ok(parse_records(&self.read_text()?))
    }

    /// Raw file contents, header included.
    pub fn read_text(&self) -> Result<String, LedgerError> {
        read_ledger_text(&self.path)
    }
}

/// Raw contents of a ledger file, header included.
pub fn read_ledger_text(path: impl AsRef<Path>) -> Result<String, LedgerError> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read records from a ledger file without opening it for writing.
pub fn read_ledger_file(path: impl AsRef<Path>) -> Result<Vec<AttendanceRecord>, LedgerError> {
    Ok(parse_records(&read_ledger_text(path)?))
}

fn parse_records(text: &str) -> Vec<AttendanceRecord> {
    let mut records = Vec::new();
    for (line, fields) in split_rows(text).into_iter().enumerate() {
        if line == 0 && fields.first().map(|f| f.trim()) == Some(LEDGER_HEADER[0]) {
            continue;
        }
        if fields.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        match AttendanceRecord::from_fields(&fields) {
            Some(record) => records.push(record),
            None => tracing::warn!(row = line + 1, ?fields, "skipping malformed ledger row"),
        }
    }
    records
}

fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

/// Split comma-separated text into rows of fields, honouring quoted fields.
fn split_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(name: &str, h: u32, m: u32, status: AttendanceStatus, slot: Slot) -> AttendanceRecord {
        AttendanceRecord {
            name: name.into(),
            timestamp: NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap(),
            status,
            slot,
        }
    }

    #[test]
    fn test_new_ledger_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let ledger = Ledger::open(&path, SlotPolicy::default()).unwrap();
        assert_eq!(ledger.read_text().unwrap(), "Name,Timestamp,Status,Lecture Slot\n");
        assert!(ledger.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path().join("a.csv"), SlotPolicy::default()).unwrap();

        let rows = vec![
            record("Nimal", 8, 2, AttendanceStatus::OnTime, Slot::Slot1),
            record("Kasuni", 9, 40, AttendanceStatus::Late, Slot::Slot1),
            record("Nimal", 11, 31, AttendanceStatus::OnTime, Slot::Slot2),
        ];
        for r in &rows {
            ledger.append(r).unwrap();
        }

        assert_eq!(ledger.read_all().unwrap(), rows);
        let text = ledger.read_text().unwrap();
        assert!(text.contains("Kasuni,2026-03-02 09:40:00,Late,Slot 1 (8:00-11:00)\n"));
    }

    #[test]
    fn test_reopen_rebuilds_suppression_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        let r = record("Nimal", 8, 2, AttendanceStatus::OnTime, Slot::Slot1);
        {
            let mut ledger = Ledger::open(&path, SlotPolicy::default()).unwrap();
            ledger.append(&r).unwrap();
        }

        let ledger = Ledger::open(&path, SlotPolicy::default()).unwrap();
        assert!(ledger.is_marked(r.date(), "Nimal", Slot::Slot1));
        assert!(!ledger.is_marked(r.date(), "Nimal", Slot::Slot2));
        assert!(!ledger.is_marked(r.date(), "Kasuni", Slot::Slot1));
        // Header is not duplicated on reopen.
        assert_eq!(ledger.read_text().unwrap().matches("Name,Timestamp").count(), 1);
    }

    #[test]
    fn test_names_with_commas_and_quotes_are_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path().join("a.csv"), SlotPolicy::default()).unwrap();
        let r = record("Perera, \"Sam\"", 8, 0, AttendanceStatus::OnTime, Slot::Slot1);
        ledger.append(&r).unwrap();

        assert!(ledger.read_text().unwrap().contains("\"Perera, \"\"Sam\"\"\","));
        assert_eq!(ledger.read_all().unwrap(), vec![r]);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(
            &path,
            "Name,Timestamp,Status,Lecture Slot\n\
             Nimal,2026-03-02 08:01:00,On Time,Slot 1 (8:00-11:00)\n\
             garbage line\n\
             Kasuni,not-a-date,Late,Slot 1 (8:00-11:00)",
        )
        .unwrap();

        let mut ledger = Ledger::open(&path, SlotPolicy::default()).unwrap();
        assert_eq!(ledger.read_all().unwrap().len(), 1);

        // A missing trailing newline is repaired before the next append.
        let r = record("Ruwan", 11, 40, AttendanceStatus::Late, Slot::Slot2);
        ledger.append(&r).unwrap();
        let all = ledger.read_all().unwrap();
        assert_eq!(all.last(), Some(&r));
    }

    #[test]
    fn test_split_rows_handles_crlf_and_quotes() {
        let rows = split_rows("a,\"b,c\"\r\n\"d\"\"e\",f\n");
        assert_eq!(rows, vec![vec!["a", "b,c"], vec!["d\"e", "f"]]);
    }

    #[test]
    fn test_read_ledger_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_ledger_file(dir.path().join("nope.csv")),
            Err(LedgerError::Io { .. })
        ));
    }

    /// In-memory sink that accepts `room` bytes, then fails like a full disk.
    struct FullDisk {
        bytes: std::cell::RefCell<Vec<u8>>,
        room: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut bytes = self.bytes.borrow_mut();
            let n = buf.len().min(self.room.saturating_sub(bytes.len()));
            if n == 0 {
                return Err(io::Error::other("no space left"));
            }
            bytes.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RowSink for FullDisk {
        fn len(&self) -> io::Result<u64> {
            Ok(self.bytes.borrow().len() as u64)
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }

        fn truncate(&self, len: u64) -> io::Result<()> {
            self.bytes.borrow_mut().truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_write_leaves_no_partial_row() {
        let header = b"Name,Timestamp,Status,Lecture Slot\n";
        let mut sink = FullDisk {
            bytes: std::cell::RefCell::new(header.to_vec()),
            room: header.len() + 10,
        };
        let row = record("Nimal", 8, 2, AttendanceStatus::OnTime, Slot::Slot1)
            .to_row(&SlotPolicy::default());

        assert!(append_row(&mut sink, row.as_bytes()).is_err());
        assert_eq!(sink.bytes.borrow().as_slice(), header);

        sink.room = usize::MAX;
        append_row(&mut sink, row.as_bytes()).unwrap();
        assert!(sink.bytes.borrow().ends_with(row.as_bytes()));
    }

    #[test]
    fn test_failed_append_keeps_index_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        let mut ledger = Ledger::open(&path, SlotPolicy::default()).unwrap();
        let r = record("Nimal", 8, 2, AttendanceStatus::OnTime, Slot::Slot1);

        // A directory in place of the file makes the reopen for append fail.
        let saved = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        assert!(matches!(ledger.append(&r), Err(LedgerError::Io { .. })));
        assert!(!ledger.is_marked(r.date(), "Nimal", Slot::Slot1));

        std::fs::remove_dir(&path).unwrap();
        std::fs::write(&path, &saved).unwrap();
        ledger.append(&r).unwrap();
        assert_eq!(ledger.read_all().unwrap(), vec![r]);
    }
}
