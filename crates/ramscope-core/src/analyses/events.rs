//! Event-log extraction from the persistent-RAM store.
//!
//! The store keeps per-cpu event zones (register read/write traces) and a
//! console zone. Zones are physically circular buffers, so the recovered
//! text is not time-ordered; each entry carries its own nanosecond
//! timestamp in a fixed line grammar, and the extractor re-emits entries
//! sorted by that timestamp.
//!
//! Raw entry format:
//!
//! ```text
//! io_read: type=readl cpu=1 ts:58270610802 data=0xffffff8009de8614 caller=qcom_geni_serial_start_tx+0x114/0x150
//! ```

use crate::error::{AnalysisError, Result};
use crate::report::ReportSink;
use crate::session::Session;
use crate::types::PhysAddr;

/// One parsed event entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord
{
    pub timestamp_ns: u64,
    pub label: String,
    pub event_type: String,
    pub data: String,
    pub caller: String,
}

impl EventRecord
{
    /// Rendered output line, timestamp first in seconds.
    pub fn render(&self) -> String
    {
        format!(
            "[{:.9}] {} : {} from address {} called from {}",
            self.timestamp_ns as f64 / 1_000_000_000.0,
            self.label,
            self.event_type,
            self.data,
            self.caller
        )
    }
}

fn field<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str>
{
    let tail = text.split(start).nth(1)?;
    Some(tail.split(end).next().unwrap_or(tail).trim())
}

/// Parse one raw event line. Lines that don't match the grammar are
/// skipped by the caller.
pub fn parse_event_line(line: &str) -> Option<EventRecord>
{
    let (label, rest) = line.split_once(':')?;
    let label = label.trim();
    if !label.starts_with("io_") {
        return None;
    }

    let event_type = field(rest, "type=", "cpu=")?;
    let timestamp = field(rest, "ts:", "data=")?;
    let data = field(rest, "data=", "caller=")?;
    let caller = rest.split("caller=").nth(1)?.trim();

    Some(EventRecord {
        timestamp_ns: timestamp.parse().ok()?,
        label: label.to_string(),
        event_type: event_type.to_string(),
        data: data.to_string(),
        caller: caller.to_string(),
    })
}

/// Sort parsed entries ascending by timestamp.
pub fn sort_events(mut records: Vec<EventRecord>) -> Vec<EventRecord>
{
    records.sort_by_key(|record| record.timestamp_ns);
    records
}

fn ascii_text(bytes: &[u8]) -> String
{
    bytes
        .iter()
        .filter(|byte| byte.is_ascii() && (!byte.is_ascii_control() || **byte == b'\n'))
        .map(|byte| *byte as char)
        .collect()
}

/// Extract the per-cpu event zones (sorted) and the console zone (raw).
pub fn extract_event_logs(session: &Session, events_out: &mut dyn ReportSink, console_out: &mut dyn ReportSink)
    -> Result<()>
{
    let pstore = session
        .layout()
        .and_then(|layout| layout.pstore)
        .ok_or_else(|| AnalysisError::MissingDebugField {
            type_name: "struct ramoops_context".to_string(),
            field: "eprzs".to_string(),
        })?;
    let base = session
        .address_of("oops_cxt")
        .ok_or_else(|| AnalysisError::UnresolvedSymbol("oops_cxt".to_string()))?;

    let mem = session.mem();

    // Per-cpu event zones: an array of zone pointers, one buffer per cpu
    // laid out back to back in physical memory.
    let event_zones = mem
        .read_pointer(base + pstore.event_zones)
        .and_then(|array| mem.read_pointer(array));
    if let Some(zone) = event_zones {
        let start = mem.read_u32(zone + pstore.zone_paddr);
        let size = mem.read_u32(zone + pstore.zone_size);
        if let (Some(start), Some(size)) = (start, size) {
            let cpus = session.num_cpus().unwrap_or(1);
            for cpu in 0..cpus {
                let zone_base = u64::from(start) + u64::from(size) * u64::from(cpu);
                let Some(bytes) = session.image().read_physical(PhysAddr::new(zone_base), size as usize) else {
                    continue;
                };
                events_out.line(&format!("--- cpu {cpu} ---"));
                let text = ascii_text(&bytes);
                let records = sort_events(text.lines().filter_map(parse_event_line).collect());
                for record in records {
                    events_out.line(&record.render());
                }
            }
        }
    }

    // Console zone: one contiguous ASCII log, emitted as-is.
    let console_zone = mem.read_pointer(base + pstore.console_zone);
    if let Some(zone) = console_zone {
        let start = mem.read_u32(zone + pstore.zone_paddr);
        let size = mem.read_u32(zone + pstore.zone_size);
        if let (Some(start), Some(size)) = (start, size) {
            if let Some(bytes) = session.image().read_physical(PhysAddr::new(u64::from(start)), size as usize) {
                console_out.raw(ascii_text(&bytes).as_bytes());
            }
        }
    }

    Ok(())
}
