//! End-to-end tests over a hand-built 32-bit mini dump: session setup,
//! task dump and panic detection against synthetic kernel memory.

mod common;

use std::path::PathBuf;

use common::{Builder, PAGE_OFFSET, PHYS_BASE};
use ramscope_core::analyses::{panic, tasks};
use ramscope_core::debuginfo::DebugInfo;
use ramscope_core::report::BufferSink;
use ramscope_core::types::VirtAddr;
use ramscope_core::{Session, SessionConfig};
use tempfile::TempDir;

const BANNER: &str = "Linux version 4.14.117 (synthetic test build)";

const BANNER_VA: u64 = PAGE_OFFSET + 0x100;
const IN_PANIC_VA: u64 = PAGE_OFFSET + 0x200;
const SWAPPER_VA: u64 = PAGE_OFFSET + 0x4000;
const STEXT_VA: u64 = PAGE_OFFSET + 0x8000;
const PANIC_FN_VA: u64 = PAGE_OFFSET + 0x9000;
const MODULES_VA: u64 = PAGE_OFFSET + 0x13000;
const MODULE_VA: u64 = PAGE_OFFSET + 0x13100;
const TASK_A: u64 = PAGE_OFFSET + 0x10000;
const TASK_B: u64 = PAGE_OFFSET + 0x11000;
const TASK_C: u64 = PAGE_OFFSET + 0x12000;
const STACK_VA: u64 = PAGE_OFFSET + 0x20000;

// task_struct member offsets served by the fake provider
const OFF_THREAD_INFO: u64 = 0x0;
const OFF_TASKS: u64 = 0x20;
const OFF_THREAD_GROUP: u64 = 0x30;
const OFF_COMM: u64 = 0x40;
const OFF_PID: u64 = 0x50;
const OFF_STACK: u64 = 0x54;
const OFF_STATE: u64 = 0x58;
const OFF_PRIO: u64 = 0x5c;
const OFF_SCHED_CLASS: u64 = 0x60;
const OFF_EXIT_STATE: u64 = 0x64;
const OFF_CPU: u64 = 0x68;

/// Table-backed stand-in for the DWARF provider.
struct FakeInfo;

impl DebugInfo for FakeInfo
{
    fn address_of(&self, symbol: &str) -> Option<VirtAddr>
    {
        let addr = match symbol {
            "linux_banner" => BANNER_VA,
            "in_panic" => IN_PANIC_VA,
            "swapper_pg_dir" => SWAPPER_VA,
            "stext" => STEXT_VA,
            "init_task" => TASK_A,
            "modules" => MODULES_VA,
            _ => return None,
        };
        Some(VirtAddr::new(addr))
    }

    fn size_of(&self, _type_name: &str) -> Option<u64>
    {
        None
    }

    fn field_offset(&self, type_name: &str, field: &str) -> Option<u64>
    {
        match (type_name, field) {
            ("struct list_head", "next") => Some(0),
            ("struct list_head", "prev") => Some(4),
            ("struct task_struct", "thread_info") => Some(OFF_THREAD_INFO),
            ("struct task_struct", "tasks") => Some(OFF_TASKS),
            ("struct task_struct", "thread_group") => Some(OFF_THREAD_GROUP),
            ("struct task_struct", "comm") => Some(OFF_COMM),
            ("struct task_struct", "pid") => Some(OFF_PID),
            ("struct task_struct", "stack") => Some(OFF_STACK),
            ("struct task_struct", "state") => Some(OFF_STATE),
            ("struct task_struct", "prio") => Some(OFF_PRIO),
            ("struct task_struct", "sched_class") => Some(OFF_SCHED_CLASS),
            ("struct task_struct", "exit_state") => Some(OFF_EXIT_STATE),
            ("struct task_struct", "cpu") => Some(OFF_CPU),
            ("struct module", "list") => Some(0x8),
            ("struct module", "core_layout.base") => Some(0x10),
            ("struct module", "name") => Some(0x18),
            _ => None,
        }
    }

    fn string_value_of(&self, symbol: &str) -> Option<String>
    {
        (symbol == "linux_banner").then(|| BANNER.to_string())
    }
}

fn off(va: u64) -> usize
{
    (va - PAGE_OFFSET) as usize
}

fn put_task(b: &mut Builder, task: u64, comm: &str, pid: u32, state: u32)
{
    let mut name = [0u8; 16];
    name[..comm.len()].copy_from_slice(comm.as_bytes());
    b.put_bytes(off(task + OFF_COMM), &name);
    b.put_u32(off(task + OFF_PID), pid);
    b.put_u32(off(task + OFF_STACK), STACK_VA as u32);
    b.put_u32(off(task + OFF_STATE), state);
    b.put_u32(off(task + OFF_PRIO), 120);
    // Thread group of one: the ring is just the task itself.
    b.put_u32(off(task + OFF_THREAD_GROUP), (task + OFF_THREAD_GROUP) as u32);
    b.put_u32(off(task + OFF_THREAD_GROUP + 4), (task + OFF_THREAD_GROUP) as u32);
}

fn build_dump(panicking: bool) -> Builder
{
    let mut b = Builder::new(0x24000);
    let mut banner = BANNER.as_bytes().to_vec();
    banner.push(0);
    b.put_bytes(off(BANNER_VA), &banner);
    b.put_u32(off(IN_PANIC_VA), u32::from(panicking));

    put_task(&mut b, TASK_A, "init", 1, 0);
    put_task(&mut b, TASK_B, "worker", 2, 1);
    put_task(&mut b, TASK_C, "blocked", 3, 2);

    // all-tasks ring A -> B -> C -> A, prev links mirrored
    let link = |task: u64| (task + OFF_TASKS) as u32;
    b.put_u32(off(TASK_A + OFF_TASKS), link(TASK_B));
    b.put_u32(off(TASK_B + OFF_TASKS), link(TASK_C));
    b.put_u32(off(TASK_C + OFF_TASKS), link(TASK_A));
    b.put_u32(off(TASK_A + OFF_TASKS + 4), link(TASK_C));
    b.put_u32(off(TASK_B + OFF_TASKS + 4), link(TASK_A));
    b.put_u32(off(TASK_C + OFF_TASKS + 4), link(TASK_B));

    // one loaded module, ring of the bare list head and the module's link
    b.put_u32(off(MODULES_VA), (MODULE_VA + 0x8) as u32);
    b.put_u32(off(MODULES_VA + 4), (MODULE_VA + 0x8) as u32);
    b.put_u32(off(MODULE_VA + 0x8), MODULES_VA as u32);
    b.put_u32(off(MODULE_VA + 0xc), MODULES_VA as u32);
    b.put_u32(off(MODULE_VA + 0x10), 0xbf00_0000);
    b.put_bytes(off(MODULE_VA + 0x18), b"wlan\0");

    if panicking {
        // A saved return address inside panic(), partway into the stack.
        b.put_u32(off(STACK_VA + 0x10), (PANIC_FN_VA + 0x10) as u32);
        b.put_u32(off(STACK_VA + 0x14), (STEXT_VA + 0x100) as u32);
    }
    b
}

fn open_session(dir: &TempDir, panicking: bool) -> Session
{
    let path = dir.path().join("DDRCS0.BIN");
    std::fs::write(&path, &build_dump(panicking).buf).unwrap();

    let config = SessionConfig {
        dump_dir: None,
        segment_files: vec![(path, PHYS_BASE)],
        vmlinux: PathBuf::from("vmlinux"),
        arm64: false,
        kaslr_offset: None,
        kaslr_probe_addr: None,
        phys_offset: None,
        page_offset: None,
    };
    let symbols = vec![
        (STEXT_VA, "stext".to_string()),
        (PANIC_FN_VA, "panic".to_string()),
    ];
    Session::with_parts(config, Box::new(FakeInfo), symbols).unwrap()
}

#[test]
fn test_session_setup_probes_geometry_and_matches_banner()
{
    let dir = TempDir::new().unwrap();
    let session = open_session(&dir, false);

    assert_eq!(session.banner(), BANNER);
    assert_eq!(session.version().to_string(), "4.14.117");
    assert!(!session.arm64());
    assert_eq!(session.thread_size(), 8192);
    assert!(session.layout().is_some());
}

#[test]
fn test_task_dump_walks_all_processes()
{
    let dir = TempDir::new().unwrap();
    let session = open_session(&dir, false);

    let mut out = BufferSink::new();
    let mut highlight = BufferSink::new();
    tasks::dump_tasks(&session, &mut out, &mut highlight).unwrap();

    let text = out.lines.join("\n");
    assert!(text.contains("Process: init,"));
    assert!(text.contains("Task name: worker pid: 2"));
    assert!(text.contains("Task name: blocked pid: 3"));
    // Run-state letters decode from the state word.
    assert!(text.contains("state: 0x0[R]"));
    assert!(text.contains("state: 0x1[S]"));
    assert!(text.contains("state: 0x2[D]"));
    // The ring is intact, so no corruption diagnostics.
    assert!(!text.contains("corrupt"));

    // Only the runnable and uninterruptible tasks are highlighted.
    let highlighted = highlight.lines.join("\n");
    assert!(highlighted.contains("init"));
    assert!(highlighted.contains("blocked"));
    assert!(!highlighted.contains("worker"));
}

#[test]
fn test_task_dump_is_idempotent()
{
    let dir = TempDir::new().unwrap();
    let session = open_session(&dir, false);

    let mut first = BufferSink::new();
    let mut second = BufferSink::new();
    let mut scratch = BufferSink::new();
    tasks::dump_tasks(&session, &mut first, &mut scratch).unwrap();
    tasks::dump_tasks(&session, &mut second, &mut scratch).unwrap();
    assert_eq!(first.lines, second.lines);
}

#[test]
fn test_panic_detector_ignores_quiet_dump()
{
    let dir = TempDir::new().unwrap();
    let session = open_session(&dir, false);

    let mut out = BufferSink::new();
    assert!(!panic::check_for_panic(&session, &mut out).unwrap());
    assert!(out.lines.iter().any(|l| l.contains("No kernel panic detected")));
}

#[test]
fn test_panic_detector_finds_faulting_task()
{
    let dir = TempDir::new().unwrap();
    let session = open_session(&dir, true);

    let mut out = BufferSink::new();
    assert!(panic::check_for_panic(&session, &mut out).unwrap());

    let text = out.lines.join("\n");
    assert!(text.contains("KERNEL PANIC detected"));
    // Only init is runnable, and its stack holds the panic return.
    assert!(text.contains("Faulting process found! Name init"));
    assert!(text.contains("panic+0x10"));
    assert!(text.contains(&format!("pc 0x{:x}", PANIC_FN_VA + 0x10)));
}

#[test]
fn test_module_discovery_without_objects_merges_nothing()
{
    let dir = TempDir::new().unwrap();
    let mut session = open_session(&dir, false);
    let before = session.symbols().len();

    // The module list walks cleanly, but no wlan.ko exists in the symbol
    // directory, so nothing is merged and nothing fails.
    let merged = session.merge_module_symbols(dir.path()).unwrap();
    assert_eq!(merged, 0);
    assert_eq!(session.symbols().len(), before);
}

#[test]
fn test_version_mismatch_is_fatal()
{
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("DDRCS0.BIN");
    let mut b = build_dump(false);
    // Corrupt the in-dump banner text.
    b.put_bytes(off(BANNER_VA), b"Linux version 9.9.9 (other)\0");
    std::fs::write(&path, &b.buf).unwrap();

    let config = SessionConfig {
        dump_dir: None,
        segment_files: vec![(path, PHYS_BASE)],
        vmlinux: PathBuf::from("vmlinux"),
        arm64: false,
        kaslr_offset: None,
        kaslr_probe_addr: None,
        phys_offset: None,
        page_offset: None,
    };
    let symbols = vec![(STEXT_VA, "stext".to_string())];
    let err = Session::with_parts(config, Box::new(FakeInfo), symbols).unwrap_err();
    assert!(matches!(err, ramscope_core::AnalysisError::VersionMismatch { .. }));
}
