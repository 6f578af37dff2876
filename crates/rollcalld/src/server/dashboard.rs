//! Server-side rendering of the dashboard page.

use rollcall_core::ledger::TIMESTAMP_FORMAT;
use rollcall_core::{AttendanceRecord, AttendanceStatus, SlotPolicy};
use std::fmt::Write;

const TEMPLATE: &str = include_str!("dashboard.html");

pub fn render(records: &[AttendanceRecord], latecomers: usize, policy: &SlotPolicy) -> String {
    let mut rows = String::new();
    for record in records {
        let class = match record.status {
            AttendanceStatus::OnTime => "on-time",
            AttendanceStatus::Late => "late",
        };
        let _ = writeln!(
            rows,
            "          <tr><td>{}</td><td>{}</td><td class=\"{class}\">{}</td><td>{}</td></tr>",
            escape(&record.name),
            record.timestamp.format(TIMESTAMP_FORMAT),
            record.status,
            escape(&policy.label(record.slot)),
        );
    }
    if records.is_empty() {
        rows.push_str("          <tr><td colspan=\"4\">No logs yet.</td></tr>\n");
    }

    let slots = format!(
        "Lectures: {} and {}",
        policy.label(rollcall_core::Slot::Slot1),
        policy.label(rollcall_core::Slot::Slot2)
    );

    TEMPLATE
        .replace("{{slot}}", &escape(&slots))
        .replace("{{latecomers}}", &latecomers.to_string())
        .replace("{{rows}}", &rows)
}

/// Minimal HTML escaping for text content and attribute values.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
