//! Task dump: every process and thread with state, priority, scheduling
//! timestamps and a full unwound backtrace.

use tracing::warn;

use super::{emit_backtrace, task_offsets, walk_processes, walk_threads};
use crate::debuginfo::TaskOffsets;
use crate::error::Result;
use crate::report::ReportSink;
use crate::session::Session;
use crate::types::{task_state_char, TaskHandle};

const TASK_COMM_LEN: usize = 16;

/// Fields of one thread record, read out of the image.
pub struct ThreadRecord
{
    pub task: TaskHandle,
    pub name: String,
    pub pid: i32,
    pub prio: i32,
    pub cpu: Option<u32>,
    pub state: u64,
    pub state_char: char,
    pub exit_state: Option<u64>,
    pub stack_base: Option<u64>,
    pub affinity: Option<u64>,
    /// Nanoseconds; zero when the build lacks the field.
    pub last_enqueued_ns: u64,
    pub last_sleep_ns: u64,
}

/// Read a thread's record. `None` marks a record too corrupt to report.
pub(crate) fn read_thread(session: &Session, offsets: &TaskOffsets, task: TaskHandle) -> Option<ThreadRecord>
{
    let mem = session.mem();
    let base = task.addr();

    let name = mem.read_cstring(base + offsets.comm, TASK_COMM_LEN)?;
    if name.is_empty() {
        return None;
    }
    // prio is a plain int and can be negative for deadline tasks.
    let prio = mem.read_u32(base + offsets.prio)? as i32;
    let pid = mem.read_u32(base + offsets.pid)? as i32;
    let state = mem.read_word(base + offsets.state)?;

    let read_ns = |offset: Option<u64>| {
        offset
            .and_then(|off| mem.read_u64(base + off))
            .unwrap_or(0)
    };

    Some(ThreadRecord {
        task,
        name,
        pid,
        prio,
        cpu: session.task_cpu(task),
        state,
        state_char: task_state_char(state),
        exit_state: offsets
            .exit_state
            .and_then(|off| mem.read_u32(base + off))
            .map(u64::from),
        stack_base: mem.read_word(base + offsets.stack),
        affinity: offsets.affinity.and_then(|off| mem.read_u64(base + off)),
        last_enqueued_ns: read_ns(offsets.last_enqueued_ts),
        last_sleep_ns: read_ns(offsets.last_sleep_ts),
    })
}

fn seconds(ns: u64) -> f64
{
    ns as f64 / 1_000_000_000.0
}

/// Dump every task with its backtrace.
///
/// `out` receives the full report; `highlight` receives only the runnable
/// and uninterruptible-sleep tasks, the ones that usually explain a hang.
pub fn dump_tasks(session: &Session, out: &mut dyn ReportSink, highlight: &mut dyn ReportSink) -> Result<()>
{
    let offsets = task_offsets(session)?;
    let processes = walk_processes(session)?;

    highlight.line("=====List of all running and uninterruptible sleep processes====");

    for process in &processes.nodes {
        let threads = walk_threads(session, *process)?;
        let mut first = true;
        for thread in &threads.nodes {
            let task = TaskHandle::new(*thread);
            let Some(record) = read_thread(session, offsets, task) else {
                warn!("unreadable task record at {task}");
                continue;
            };

            if first {
                out.line(&format!(
                    "Process: {}, [affinity: 0x{:x}] cpu: {} pid: {} start: 0x{:x}",
                    record.name,
                    record.affinity.unwrap_or(0),
                    record.cpu.unwrap_or(0),
                    record.pid,
                    record.task.addr().value()
                ));
                out.line("=====================================================");
                first = false;
            }

            out.line(&format!(
                "    Task name: {} pid: {} cpu: {} prio: {} start: {:x}",
                record.name,
                record.pid,
                record.cpu.unwrap_or(0),
                record.prio,
                record.task.addr().value()
            ));
            out.line(&format!(
                "    state: 0x{:x}[{}] exit_state: 0x{:x} stack base: 0x{:x}",
                record.state,
                record.state_char,
                record.exit_state.unwrap_or(0),
                record.stack_base.unwrap_or(0)
            ));
            out.line(&format!(
                "    Last_enqueued_ts:{:18.9} Last_sleep_ts:{:18.9}",
                seconds(record.last_enqueued_ns),
                seconds(record.last_sleep_ns)
            ));
            out.line("    Stack:");
            if let Some(frame) = session.saved_frame(task) {
                emit_backtrace(session, frame, "    ", out);
            } else {
                out.line("    (no saved context)");
            }
            out.line("=======================================================");

            // Anything not in plain interruptible sleep is highlight
            // material.
            if record.state != 1 {
                highlight.line(&format!(
                    "PID {:6} cpu {} state {:>4} hex 0x{:06x} start 0x{:x} comm {}",
                    record.pid,
                    record.cpu.unwrap_or(0),
                    record.state_char,
                    record.state,
                    record.task.addr().value(),
                    record.name
                ));
                if let Some(frame) = session.saved_frame(task) {
                    emit_backtrace(session, frame, "    ", highlight);
                }
            }
        }

        if let Some(reason) = &threads.corruption {
            out.line(&format!("!!!! Cycle in thread group! The list is corrupt! ({reason})"));
        }
    }

    if !processes.complete {
        out.line("!!! Cycle in task list! The list is corrupt!");
        out.line("!!! Some tasks may be missing from this report");
    }

    Ok(())
}

/// Per-cpu scheduling statistics, sorted by last arrival time.
///
/// Emitted only when the build carries `sched_info` accounting.
pub fn dump_sched_stats(session: &Session, out: &mut dyn ReportSink) -> Result<()>
{
    let offsets = task_offsets(session)?;
    let Some(sched_info) = offsets.sched_info else {
        out.line("sched_info accounting not present in this build");
        return Ok(());
    };

    let mem = session.mem();
    let processes = walk_processes(session)?;
    let cpus = session.num_cpus().unwrap_or(1).max(1);
    let mut per_cpu: Vec<Vec<(ThreadRecord, u64, u64, u64, u64)>> = (0..cpus).map(|_| Vec::new()).collect();
    let mut truncated = !processes.complete;

    for process in &processes.nodes {
        let threads = walk_threads(session, *process)?;
        truncated |= !threads.complete;
        for thread in &threads.nodes {
            let task = TaskHandle::new(*thread);
            let Some(record) = read_thread(session, offsets, task) else {
                truncated = true;
                continue;
            };
            let base = task.addr();
            let last_arrival = mem.read_u64(base + sched_info.last_arrival).unwrap_or(0);
            let last_queued = mem.read_u64(base + sched_info.last_queued).unwrap_or(0);
            let run_delay = mem.read_u64(base + sched_info.run_delay).unwrap_or(0);
            let pcount = mem.read_word(base + sched_info.pcount).unwrap_or(0);
            let cpu = record.cpu.unwrap_or(0).min(cpus.saturating_sub(1));
            per_cpu[cpu as usize].push((record, last_arrival, last_queued, run_delay, pcount));
        }
    }

    for (cpu, mut rows) in per_cpu.into_iter().enumerate() {
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        out.line(&format!("CPU {cpu}"));
        if truncated {
            out.line("!!! Note: some threads may be missing");
        }
        out.line(&format!(
            "{:<17}{:>8}{:>18}{:>18}{:>18}{:>17} {:>8}{:>8}{:>18}{:>18}",
            "Task name",
            "PID",
            "Exec_Started_at",
            "Last_Queued_at",
            "Total_wait_time",
            "No_of_times_exec",
            "Prio",
            "State",
            "Last_enqueued_ts",
            "Last_sleep_ts"
        ));
        for (record, last_arrival, last_queued, run_delay, pcount) in rows {
            out.line(&format!(
                "{:<17}{:8}{:18.9}{:18.9}{:18.9}{:17}{:8}{:>9}{:18.9}{:18.9}",
                record.name,
                record.pid,
                seconds(last_arrival),
                seconds(last_queued),
                seconds(run_delay),
                pcount,
                record.prio,
                record.state_char,
                seconds(record.last_enqueued_ns),
                seconds(record.last_sleep_ns)
            ));
        }
    }

    Ok(())
}
