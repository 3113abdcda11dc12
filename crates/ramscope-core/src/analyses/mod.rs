//! # Analyses
//!
//! Consumers composed from the components beneath them: task dump, panic
//! detection, event-log extraction and scheduler sanity checks. Each one
//! reads through the session, emits records through a [`ReportSink`], and
//! degrades locally; a corrupt list or missing field costs one output
//! section, never the run.

pub mod events;
pub mod panic;
pub mod sched;
pub mod tasks;

use crate::debuginfo::TaskOffsets;
use crate::error::{AnalysisError, Result};
use crate::report::ReportSink;
use crate::session::Session;
use crate::types::{TaskHandle, VirtAddr};
use crate::unwind::FrameState;
use crate::walker::{walk_circular, WalkOutcome};

/// Backstop for frame-pointer chains that manage to loop despite the
/// bounds checks.
pub(crate) const MAX_BACKTRACE_FRAMES: usize = 256;

/// Emit a symbolized backtrace, one frame per line.
pub(crate) fn emit_backtrace(session: &Session, frame: FrameState, prefix: &str, sink: &mut dyn ReportSink)
{
    let mem = session.mem();
    for record in session
        .unwinder()
        .backtrace(mem, session.symbols(), frame)
        .take(MAX_BACKTRACE_FRAMES)
    {
        sink.line(&format!(
            "{prefix}[<{:x}>] {}+0x{:x}",
            record.pc, record.symbol, record.offset
        ));
    }
}

pub(crate) fn task_offsets(session: &Session) -> Result<&TaskOffsets>
{
    session
        .layout()
        .and_then(|layout| layout.task.as_ref())
        .ok_or_else(|| AnalysisError::MissingDebugField {
            type_name: "struct task_struct".to_string(),
            field: "tasks".to_string(),
        })
}

/// Walk the all-tasks ring anchored at `init_task`.
pub(crate) fn walk_processes(session: &Session) -> Result<WalkOutcome>
{
    let offsets = task_offsets(session)?;
    let list = session
        .layout()
        .map(|layout| layout.list)
        .ok_or_else(|| AnalysisError::Setup("no structure layout".to_string()))?;
    let anchor = session
        .address_of("init_task")
        .ok_or_else(|| AnalysisError::UnresolvedSymbol("init_task".to_string()))?;

    let classes = session.sched_class_set();
    let mem = session.mem();
    Ok(walk_circular(&mem, anchor, offsets.tasks, list, |node| {
        let task = TaskHandle::new(node);
        session.validate_task(task) && session.validate_sched_class(task, &classes)
    }))
}

/// Walk one process's thread-group ring.
pub(crate) fn walk_threads(session: &Session, process: VirtAddr) -> Result<WalkOutcome>
{
    let offsets = task_offsets(session)?;
    let list = session
        .layout()
        .map(|layout| layout.list)
        .ok_or_else(|| AnalysisError::Setup("no structure layout".to_string()))?;

    let classes = session.sched_class_set();
    let mem = session.mem();
    Ok(walk_circular(&mem, process, offsets.thread_group, list, |node| {
        let task = TaskHandle::new(node);
        session.validate_task(task) && session.validate_sched_class(task, &classes)
    }))
}
