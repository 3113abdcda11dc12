//! # Stack Unwinding
//!
//! Reconstructs call stacks from saved register state in the dump.
//!
//! Two mutually exclusive strategies, chosen once per session:
//!
//! 1. **Table-driven**: the kernel's unwind index describes, per code
//!    range, how to recover the caller's registers ([`ehabi`]).
//! 2. **Frame-pointer walk**: when no index metadata exists, follow the
//!    frame-pointer chain with strict bounds and alignment guards (the
//!    32-bit and 64-bit frame records differ in shape).
//!
//! Backtraces are produced lazily as an iterator of symbolized frames;
//! consumers may stop early. An abort loses only the current frame's
//! tail; it never raises.

pub mod ehabi;

use crate::mem::MemoryView;
use crate::symbols::{LookupMode, SymbolTable};
use crate::types::VirtAddr;

use ehabi::UnwindIndex;

/// Transient register state for one unwind walk.
///
/// Exists only for the duration of one backtrace; owned exclusively by the
/// unwind loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameState
{
    pub fp: u64,
    pub sp: u64,
    pub lr: u64,
    pub pc: u64,
}

impl FrameState
{
    pub fn new(fp: u64, sp: u64, lr: u64, pc: u64) -> Self
    {
        Self { fp, sp, lr, pc }
    }
}

/// One symbolized backtrace line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord
{
    pub pc: u64,
    /// Resolved symbol name, `"UNKNOWN"` when the pc falls outside the
    /// symbol table.
    pub symbol: String,
    pub offset: u64,
}

enum Strategy
{
    Tables(UnwindIndex),
    Generic32,
    Generic64,
}

/// Session unwinder: strategy plus the stack-size constant the bounds
/// checks derive from.
pub struct Unwinder
{
    strategy: Strategy,
    thread_size: u64,
}

impl Unwinder
{
    /// Pick the strategy for this session.
    ///
    /// The table-driven path is used when both index boundary symbols
    /// resolve and the table loads; otherwise the architecture's generic
    /// frame-pointer walk is the fallback.
    pub fn probe(
        mem: &MemoryView<'_>,
        index_start: Option<VirtAddr>,
        index_stop: Option<VirtAddr>,
        thread_size: u64,
    ) -> Self
    {
        let strategy = match (index_start, index_stop) {
            (Some(start), Some(stop)) if !mem.arm64() => match UnwindIndex::load(mem, start, stop) {
                Some(index) => Strategy::Tables(index),
                None => Strategy::Generic32,
            },
            _ => {
                if mem.arm64() {
                    Strategy::Generic64
                } else {
                    Strategy::Generic32
                }
            }
        };
        Self {
            strategy,
            thread_size,
        }
    }

    /// Advance one frame. `None` halts the walk (and loses nothing else).
    pub fn step(&self, mem: &MemoryView<'_>, frame: &FrameState) -> Option<FrameState>
    {
        match &self.strategy {
            Strategy::Tables(index) => ehabi::unwind_frame_tables(index, mem, frame, self.thread_size),
            Strategy::Generic32 => self.step_generic32(mem, frame),
            Strategy::Generic64 => self.step_generic64(mem, frame),
        }
    }

    /// 32-bit frame-pointer walk: the saved `{fp, sp, pc}` triple sits at
    /// `{fp-12, fp-8, fp-4}`.
    fn step_generic32(&self, mem: &MemoryView<'_>, frame: &FrameState) -> Option<FrameState>
    {
        let fp = frame.fp;
        let low = frame.sp;
        let mask = self.thread_size - 1;
        let high = (low + mask) & !mask;

        // The whole frame record must fit inside the stack.
        if fp < low + 12 || fp + 4 >= high {
            return None;
        }

        Some(FrameState {
            fp: mem.read_word(VirtAddr::new(fp - 12))?,
            sp: mem.read_word(VirtAddr::new(fp - 8))?,
            lr: frame.lr,
            pc: mem.read_word(VirtAddr::new(fp - 4))?,
        })
    }

    /// 64-bit frame-pointer walk: `{fp, fp+8}` hold the caller's
    /// `{fp, pc}`, and frame records are 16-byte aligned.
    fn step_generic64(&self, mem: &MemoryView<'_>, frame: &FrameState) -> Option<FrameState>
    {
        let fp = frame.fp;
        let low = frame.sp;
        let mask = self.thread_size - 1;
        let high = (low + mask) & !mask;

        if fp < low || fp > high || fp & 0xf != 0 {
            return None;
        }

        Some(FrameState {
            fp: mem.read_word(VirtAddr::new(fp))?,
            sp: fp + 0x10,
            lr: frame.lr,
            pc: mem.read_word(VirtAddr::new(fp + 8))?,
        })
    }

    /// Lazily unwind from `frame`, yielding `(pc, symbol, offset)` records
    /// until the walk halts.
    pub fn backtrace<'a>(
        &'a self,
        mem: MemoryView<'a>,
        symbols: &'a SymbolTable,
        frame: FrameState,
    ) -> Backtrace<'a>
    {
        Backtrace {
            unwinder: self,
            mem,
            symbols,
            frame: Some(frame),
        }
    }
}

/// Streaming backtrace iterator.
///
/// Each item symbolizes the current frame, then attempts one unwind step;
/// when the step fails the iterator ends. The sequence is deterministic
/// and finite for identical input.
pub struct Backtrace<'a>
{
    unwinder: &'a Unwinder,
    mem: MemoryView<'a>,
    symbols: &'a SymbolTable,
    frame: Option<FrameState>,
}

impl Iterator for Backtrace<'_>
{
    type Item = FrameRecord;

    fn next(&mut self) -> Option<Self::Item>
    {
        let frame = self.frame.take()?;

        let record = match self.symbols.lookup(Some(frame.pc), LookupMode::Offset) {
            Some((name, offset)) => FrameRecord {
                pc: frame.pc,
                symbol: name.to_string(),
                offset,
            },
            None => FrameRecord {
                pc: frame.pc,
                symbol: "UNKNOWN".to_string(),
                offset: 0,
            },
        };

        self.frame = self.unwinder.step(&self.mem, &frame);
        Some(record)
    }
}
