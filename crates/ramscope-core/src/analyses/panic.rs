//! Panic detection: find the faulting task by scanning raw stack words
//! for a saved return address inside `panic`, then unwind from there.
//!
//! This deliberately bypasses the unwinder for the search itself: the
//! panicking frame chain is often half-built, so the scan treats every
//! properly aligned stack slot as a potential frame record and lets the
//! symbol table decide.

use super::{emit_backtrace, task_offsets, walk_processes, walk_threads};
use crate::error::{AnalysisError, Result};
use crate::report::ReportSink;
use crate::session::Session;
use crate::symbols::LookupMode;
use crate::types::{TaskHandle, VirtAddr};
use crate::unwind::FrameState;

/// Check the panic flag; when set, locate the faulting task and emit its
/// backtrace plus the recovered register record.
///
/// Returns whether a panic was found.
pub fn check_for_panic(session: &Session, out: &mut dyn ReportSink) -> Result<bool>
{
    let addr = session
        .address_of("in_panic")
        .ok_or_else(|| AnalysisError::UnresolvedSymbol("in_panic".to_string()))?;
    let flag = session.mem().read_word(addr);

    if flag != Some(1) {
        out.line("No kernel panic detected");
        return Ok(false);
    }

    out.line("-------------------------------------------------");
    out.line("[!] KERNEL PANIC detected!");
    out.line("-------------------------------------------------");

    let offsets = task_offsets(session)?;
    let processes = walk_processes(session)?;
    let mut found = false;

    for process in &processes.nodes {
        let threads = walk_threads(session, *process)?;
        for thread in &threads.nodes {
            let task = TaskHandle::new(*thread);
            let Some(record) = super::tasks::read_thread(session, offsets, task) else {
                continue;
            };
            // Panicking tasks are expected to remain runnable.
            if record.state != 0 {
                continue;
            }
            let Some(stack_base) = record.stack_base else {
                continue;
            };
            if scan_stack_for_panic(session, stack_base, &record.name, out) {
                found = true;
            }
        }
    }

    if !found {
        out.line("Panic flag is set but no faulting stack was found");
    }
    Ok(true)
}

/// Walk every aligned slot of one task's stack looking for a return
/// address that resolves into `panic`; unwind from the first hit.
fn scan_stack_for_panic(session: &Session, stack_base: u64, task_name: &str, out: &mut dyn ReportSink) -> bool
{
    let mem = session.mem();
    let (stack_size, step) = if mem.arm64() { (0x4000u64, 8u64) } else { (0x2000, 4) };

    let mut addr = stack_base;
    while addr < stack_base + stack_size {
        let slot = addr;
        addr += step;

        let frame = if mem.arm64() {
            let Some(pc) = mem.read_word(VirtAddr::new(slot + 8)) else {
                continue;
            };
            let Some(fp) = mem.read_word(VirtAddr::new(slot)) else {
                continue;
            };
            // The saved address points past the call instruction.
            FrameState::new(fp, slot + 16, 0, pc.wrapping_sub(4))
        } else {
            let Some(pc) = mem.read_word(VirtAddr::new(slot)) else {
                continue;
            };
            let Some(lr) = mem.read_word(VirtAddr::new(slot + 4)) else {
                continue;
            };
            FrameState::new(0, slot + 4, lr, pc)
        };

        let Some((symbol, _)) = session.symbols().lookup(Some(frame.pc), LookupMode::Offset) else {
            continue;
        };
        if symbol != "panic" {
            continue;
        }

        out.line(&format!("Faulting process found! Name {task_name}"));
        emit_backtrace(session, frame, "", out);
        out.line(&format!("pc 0x{:x}", frame.pc));
        out.line(&format!("sp 0x{:x}", frame.sp));
        return true;
    }
    false
}
