//! # Debug Metadata
//!
//! The engine never hardcodes kernel structure layouts: symbol addresses,
//! type sizes and field offsets all come from an external capability, and
//! every lookup is fallible. A missing result means "feature absent in
//! this build" and the dependent sub-step is skipped, never raised.
//!
//! To avoid repeating external queries on every field access, the session
//! resolves everything the analyses will need exactly once, up front, into
//! a [`KernelLayout`] of plain offsets.

pub mod dwarf;

use std::fmt;

use tracing::warn;

use crate::types::VirtAddr;

/// Capability set consumed by the core.
///
/// Implementations answer layout questions about the dumped kernel build.
/// The repo ships a vmlinux-backed implementation ([`dwarf::DwarfInfo`]);
/// tests substitute table-backed fakes.
pub trait DebugInfo
{
    /// Link-time address of a symbol (unrelocated; the session applies the
    /// relocation offset).
    fn address_of(&self, symbol: &str) -> Option<VirtAddr>;

    /// Size in bytes of a type (`struct foo`, `union bar`, `void *`).
    fn size_of(&self, type_name: &str) -> Option<u64>;

    /// Byte offset of `field` from the base of `type_name`. Dotted paths
    /// (`core_layout.base`) resolve through nested members.
    fn field_offset(&self, type_name: &str, field: &str) -> Option<u64>;

    /// Initialized value of a string variable, read from the build
    /// artifact rather than the dump (e.g. the version banner).
    fn string_value_of(&self, symbol: &str) -> Option<String>;
}

/// Kernel version, ordered for the handful of version-gated layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion
{
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl KernelVersion
{
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self
    {
        Self { major, minor, patch }
    }

    /// Extract `major.minor.patch` from a version banner of the form
    /// `Linux version 4.14.117-perf (...)`.
    pub fn parse_banner(banner: &str) -> Option<Self>
    {
        let rest = banner.split("Linux version ").nth(1)?;
        let version: String = rest
            .chars()
            .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
            .collect();
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(Self { major, minor, patch })
    }
}

impl fmt::Display for KernelVersion
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// `struct list_head` member offsets.
#[derive(Debug, Clone, Copy)]
pub struct ListOffsets
{
    pub next: u64,
    pub prev: u64,
}

/// Offsets into `struct sched_info`, relative to the task base.
#[derive(Debug, Clone, Copy)]
pub struct SchedInfoOffsets
{
    pub last_arrival: u64,
    pub last_queued: u64,
    pub pcount: u64,
    pub run_delay: u64,
}

/// `struct task_struct` member offsets.
///
/// The required fields are the ones without which no task traversal is
/// possible at all; everything else degrades to a skipped output column.
#[derive(Debug, Clone)]
pub struct TaskOffsets
{
    pub tasks: u64,
    pub thread_group: u64,
    pub comm: u64,
    pub pid: u64,
    pub stack: u64,
    pub state: u64,
    pub prio: u64,
    pub sched_class: u64,
    pub exit_state: Option<u64>,
    pub affinity: Option<u64>,
    pub cpu: Option<u64>,
    /// Offset of the embedded `thread_info` when the kernel keeps it in
    /// the task (CONFIG_THREAD_INFO_IN_TASK).
    pub thread_info: Option<u64>,
    pub last_enqueued_ts: Option<u64>,
    pub last_sleep_ts: Option<u64>,
    pub sched_info: Option<SchedInfoOffsets>,
}

/// `struct thread_info` member offsets.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfoOffsets
{
    pub task: Option<u64>,
    pub cpu: Option<u64>,
}

/// Where a sleeping thread's `{fp, sp, pc}` context was parked at its last
/// switch-out.
#[derive(Debug, Clone, Copy)]
pub struct SavedContext
{
    /// The context block lives in the task itself (64-bit
    /// `task_struct.thread.cpu_context`) rather than in `thread_info`.
    pub in_task: bool,
    /// Offset of the context block from its containing structure.
    pub base: u64,
    pub fp: u64,
    pub sp: u64,
    pub pc: u64,
}

/// Per-cpu runqueue offsets for the scheduler sanity checks.
#[derive(Debug, Clone, Copy)]
pub struct RunqueueOffsets
{
    pub root_domain: Option<u64>,
    pub sched_domain: Option<u64>,
}

/// Persistent-RAM (event log) offsets.
#[derive(Debug, Clone, Copy)]
pub struct PstoreOffsets
{
    pub event_zones: u64,
    pub console_zone: u64,
    pub zone_paddr: u64,
    pub zone_size: u64,
}

/// Every offset the analyses consume, resolved once at session setup.
#[derive(Debug, Clone)]
pub struct KernelLayout
{
    pub list: ListOffsets,
    pub task: Option<TaskOffsets>,
    pub thread_info: ThreadInfoOffsets,
    pub saved_context: Option<SavedContext>,
    pub runqueue: RunqueueOffsets,
    pub pstore: Option<PstoreOffsets>,
    pub cpumask_bits: Option<u64>,
}

const TASK: &str = "struct task_struct";

fn first_offset(info: &dyn DebugInfo, type_name: &str, fields: &[&str]) -> Option<u64>
{
    fields
        .iter()
        .find_map(|field| info.field_offset(type_name, field))
}

impl KernelLayout
{
    /// Resolve all offsets against the provider.
    ///
    /// Returns `None` only when even `struct list_head` cannot be
    /// resolved, which means the metadata is unusable for traversal of any
    /// kind.
    pub fn resolve(info: &dyn DebugInfo, version: KernelVersion, arm64: bool) -> Option<Self>
    {
        let list = ListOffsets {
            next: info.field_offset("struct list_head", "next")?,
            prev: info.field_offset("struct list_head", "prev")?,
        };

        let task = Self::resolve_task(info, version);
        if task.is_none() {
            warn!("task_struct layout incomplete; task analyses will be skipped");
        }

        let thread_info = ThreadInfoOffsets {
            task: info.field_offset("struct thread_info", "task"),
            cpu: info.field_offset("struct thread_info", "cpu"),
        };

        let saved_context = Self::resolve_saved_context(info, arm64);

        let runqueue = RunqueueOffsets {
            root_domain: info.field_offset("struct rq", "rd"),
            sched_domain: info.field_offset("struct rq", "sd"),
        };

        let pstore = Self::resolve_pstore(info);

        Some(Self {
            list,
            task,
            thread_info,
            saved_context,
            runqueue,
            pstore,
            cpumask_bits: info.field_offset("struct cpumask", "bits"),
        })
    }

    fn resolve_task(info: &dyn DebugInfo, version: KernelVersion) -> Option<TaskOffsets>
    {
        // Renamed fields across kernel generations resolve through ordered
        // fallback chains; the newer name goes first from the version that
        // introduced it.
        let affinity_fields: &[&str] = if version >= KernelVersion::new(5, 3, 0) {
            &["cpus_mask", "cpus_allowed"]
        } else {
            &["cpus_allowed", "cpus_mask"]
        };

        let sched_info = info.field_offset(TASK, "sched_info").and_then(|base| {
            Some(SchedInfoOffsets {
                last_arrival: base + info.field_offset("struct sched_info", "last_arrival")?,
                last_queued: base + info.field_offset("struct sched_info", "last_queued")?,
                pcount: base + info.field_offset("struct sched_info", "pcount")?,
                run_delay: base + info.field_offset("struct sched_info", "run_delay")?,
            })
        });

        Some(TaskOffsets {
            tasks: info.field_offset(TASK, "tasks")?,
            thread_group: info.field_offset(TASK, "thread_group")?,
            comm: info.field_offset(TASK, "comm")?,
            pid: info.field_offset(TASK, "pid")?,
            stack: info.field_offset(TASK, "stack")?,
            state: first_offset(info, TASK, &["state", "__state"])?,
            prio: info.field_offset(TASK, "prio")?,
            sched_class: info.field_offset(TASK, "sched_class")?,
            exit_state: info.field_offset(TASK, "exit_state"),
            affinity: first_offset(info, TASK, affinity_fields),
            cpu: info.field_offset(TASK, "cpu"),
            thread_info: info.field_offset(TASK, "thread_info"),
            last_enqueued_ts: info.field_offset(TASK, "last_enqueued_ts"),
            last_sleep_ts: info.field_offset(TASK, "last_sleep_ts"),
            sched_info,
        })
    }

    fn resolve_saved_context(info: &dyn DebugInfo, arm64: bool) -> Option<SavedContext>
    {
        if arm64 {
            let thread = info.field_offset(TASK, "thread")?;
            let cpu_context = info.field_offset("struct thread_struct", "cpu_context")?;
            Some(SavedContext {
                in_task: true,
                base: thread + cpu_context,
                fp: info.field_offset("struct cpu_context", "fp")?,
                sp: info.field_offset("struct cpu_context", "sp")?,
                pc: info.field_offset("struct cpu_context", "pc")?,
            })
        } else {
            let cpu_context = info.field_offset("struct thread_info", "cpu_context")?;
            Some(SavedContext {
                in_task: false,
                base: cpu_context,
                fp: info.field_offset("struct cpu_context_save", "fp")?,
                sp: info.field_offset("struct cpu_context_save", "sp")?,
                pc: info.field_offset("struct cpu_context_save", "pc")?,
            })
        }
    }

    fn resolve_pstore(info: &dyn DebugInfo) -> Option<PstoreOffsets>
    {
        Some(PstoreOffsets {
            event_zones: info.field_offset("struct ramoops_context", "eprzs")?,
            console_zone: info.field_offset("struct ramoops_context", "cprz")?,
            zone_paddr: info.field_offset("struct persistent_ram_zone", "paddr")?,
            zone_size: info.field_offset("struct persistent_ram_zone", "size")?,
        })
    }
}
