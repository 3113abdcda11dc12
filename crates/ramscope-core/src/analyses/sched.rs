//! Scheduler sanity checks: compare a handful of fixed tunables and
//! per-cpu runqueue invariants against their expected defaults and flag
//! deviations as warnings. Nothing here is corrective; the value of the
//! check is knowing that load balancing was broken *before* the crash.

use crate::debuginfo::KernelVersion;
use crate::error::{AnalysisError, Result};
use crate::report::ReportSink;
use crate::session::Session;

const DEFAULT_MIGRATION_NR: u64 = 32;
const DEFAULT_MIGRATION_COST: u64 = 500_000;

/// Indices of the set bits of a cpu mask.
pub fn mask_bit_positions(mask: u64) -> Vec<u32>
{
    (0..u64::BITS).filter(|bit| mask & (1 << bit) != 0).collect()
}

fn read_u32_symbol(session: &Session, symbol: &str) -> Option<u32>
{
    session
        .address_of(symbol)
        .and_then(|addr| session.mem().read_u32(addr))
}

/// Run all checks, emitting warnings for anything off-default.
pub fn check_scheduler(session: &Session, out: &mut dyn ReportSink) -> Result<()>
{
    // Load-balancer batch size.
    match read_u32_symbol(session, "sysctl_sched_nr_migrate") {
        Some(value) if u64::from(value) != DEFAULT_MIGRATION_NR => {
            out.line("***** WARNING:");
            out.line("\t sysctl_sched_nr_migrate has changed!!");
            out.line("\t If it is single digit, the scheduler's load balancer was broken in this dump");
            out.line(&format!("\t\tDefault: {DEFAULT_MIGRATION_NR} and value in dump: {value}"));
        }
        _ => {}
    }

    // Migration cost threshold.
    match read_u32_symbol(session, "sysctl_sched_migration_cost") {
        Some(value) if u64::from(value) != DEFAULT_MIGRATION_COST => {
            out.line("***** WARNING:");
            out.line("\t sysctl_sched_migration_cost has changed!!");
            out.line(&format!("\t\tDefault: {DEFAULT_MIGRATION_COST} and value in dump: {value}"));
        }
        _ => {}
    }

    // Bandwidth control is informational, not a deviation.
    if let Some(slice) = read_u32_symbol(session, "sysctl_sched_cfs_bandwidth_slice") {
        out.line("***** INFORMATION:");
        out.line("\tCFS_BANDWIDTH is enabled in the dump!!");
        out.line(&format!("\tBandwidth slice: {slice}"));
    }

    check_root_domains(session, out)
}

/// Every online cpu should sit in a real root domain with a populated
/// sched_domain hierarchy; the boot-time defaults mean isolation or a
/// half-torn-down topology.
fn check_root_domains(session: &Session, out: &mut dyn ReportSink) -> Result<()>
{
    let mem = session.mem();

    let online_symbol = if session.version() >= KernelVersion::new(4, 9, 0) {
        "__cpu_online_mask"
    } else {
        "cpu_online_bits"
    };
    let bits_offset = session
        .layout()
        .and_then(|layout| layout.cpumask_bits)
        .unwrap_or(0);
    let online = session
        .address_of(online_symbol)
        .and_then(|addr| mem.read_word(addr + bits_offset))
        .ok_or_else(|| AnalysisError::UnresolvedSymbol(online_symbol.to_string()))?;

    let runqueues = session
        .address_of("runqueues")
        .ok_or_else(|| AnalysisError::UnresolvedSymbol("runqueues".to_string()))?;
    let offsets = session
        .layout()
        .map(|layout| layout.runqueue)
        .ok_or_else(|| AnalysisError::Setup("no structure layout".to_string()))?;
    let def_root_domain = session.address_of("def_root_domain");

    for cpu in mask_bit_positions(online) {
        let Some(pcpu) = session.per_cpu_offset(cpu) else {
            continue;
        };
        let rq = runqueues + pcpu;

        if let (Some(rd_offset), Some(def_rd)) = (offsets.root_domain, def_root_domain) {
            if mem.read_word(rq + rd_offset) == Some(def_rd.value()) {
                out.line("***** WARNING:");
                out.line(&format!(
                    "Online cpu:{cpu} is attached to the default sched root domain {def_rd}"
                ));
            }
        }

        if let Some(sd_offset) = offsets.sched_domain {
            let sd = mem.read_word(rq + sd_offset);
            if sd == Some(0) || sd.is_none() {
                out.line("***** WARNING:");
                out.line(&format!("Online cpu:{cpu} has a null sched_domain!!"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_mask_bit_positions()
    {
        assert_eq!(mask_bit_positions(0b1011), vec![0, 1, 3]);
        assert!(mask_bit_positions(0).is_empty());
        assert_eq!(mask_bit_positions(1 << 63), vec![63]);
    }
}
