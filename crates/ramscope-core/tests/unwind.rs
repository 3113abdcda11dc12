//! Unwinder tests: table-driven instruction streams and the generic
//! frame-pointer walks, over synthetic memory.

mod common;

use common::{image_from, linear32, Builder, PAGE_OFFSET, PHYS_BASE};
use ramscope_core::mem::MemoryView;
use ramscope_core::symbols::SymbolTable;
use ramscope_core::translate::{LinearMap, Translator};
use ramscope_core::types::VirtAddr;
use ramscope_core::unwind::{FrameState, Unwinder};
use tempfile::TempDir;

const FUNC_A: u64 = PAGE_OFFSET + 0x100;
const FUNC_B: u64 = PAGE_OFFSET + 0x800;
const INDEX_START: u64 = PAGE_OFFSET + 0x1000;
const INDEX_STOP: u64 = PAGE_OFFSET + 0x1010;
const STACK: u64 = PAGE_OFFSET + 0x2000;
const THREAD_SIZE: u64 = 8192;

fn off(va: u64) -> usize
{
    (va - PAGE_OFFSET) as usize
}

/// prel31 encoding of `target` relative to `site`.
fn prel31(target: u64, site: u64) -> u32
{
    (target.wrapping_sub(site) & 0x7fff_ffff) as u32
}

/// Index with two functions below the table. A's stream pops {r4, lr}
/// then finishes; B cannot be unwound.
fn table_image() -> Builder
{
    let mut b = Builder::new(0x4000);
    // entry 0: function A, inline instruction word 0x80 a8 b0 b0
    //   0xa8: pop r4 then lr; 0xb0: finish (pc := lr)
    b.put_u32(off(INDEX_START), prel31(FUNC_A, INDEX_START));
    b.put_u32(off(INDEX_START) + 4, 0x80a8_b0b0);
    // entry 1: function B, EXIDX_CANTUNWIND
    b.put_u32(off(INDEX_START) + 8, prel31(FUNC_B, INDEX_START + 8));
    b.put_u32(off(INDEX_START) + 12, 0x0000_0001);
    // stack: saved r4, then saved lr pointing into B
    b.put_u32(off(STACK), 0xdead_0004);
    b.put_u32(off(STACK) + 4, (FUNC_B + 0x50) as u32);
    b
}

fn symbols() -> SymbolTable
{
    SymbolTable::from_entries(vec![(FUNC_A, "func_a".to_string()), (FUNC_B, "func_b".to_string())])
}

#[test]
fn test_table_unwind_pops_registers_and_follows_lr()
{
    let dir = TempDir::new().unwrap();
    let image = image_from(&dir, "DDRCS0.BIN", PHYS_BASE, &table_image().buf);
    let translator = linear32();
    let mem = MemoryView::new(&image, &translator, false);

    let unwinder = Unwinder::probe(
        &mem,
        Some(VirtAddr::new(INDEX_START)),
        Some(VirtAddr::new(INDEX_STOP)),
        THREAD_SIZE,
    );

    let frame = FrameState::new(0, STACK, 0, FUNC_A + 0x50);
    let next = unwinder.step(&mem, &frame).unwrap();
    // Two pops advance sp by 8; the finish opcode promotes lr into pc.
    assert_eq!(next.sp, STACK + 8);
    assert_eq!(next.pc, FUNC_B + 0x50);

    // B's entry is cantunwind, so the walk halts there.
    assert!(unwinder.step(&mem, &next).is_none());
}

#[test]
fn test_backtrace_streams_symbolized_frames()
{
    let dir = TempDir::new().unwrap();
    let image = image_from(&dir, "DDRCS0.BIN", PHYS_BASE, &table_image().buf);
    let translator = linear32();
    let mem = MemoryView::new(&image, &translator, false);
    let symbols = symbols();

    let unwinder = Unwinder::probe(
        &mem,
        Some(VirtAddr::new(INDEX_START)),
        Some(VirtAddr::new(INDEX_STOP)),
        THREAD_SIZE,
    );

    let frame = FrameState::new(0, STACK, 0, FUNC_A + 0x50);
    let records: Vec<(String, u64)> = unwinder
        .backtrace(mem, &symbols, frame)
        .map(|r| (r.symbol, r.offset))
        .collect();
    assert_eq!(
        records,
        vec![("func_a".to_string(), 0x50), ("func_b".to_string(), 0x50)]
    );

    // Identical input, identical (finite) sequence.
    let again: Vec<(String, u64)> = unwinder
        .backtrace(mem, &symbols, frame)
        .map(|r| (r.symbol, r.offset))
        .collect();
    assert_eq!(records, again);
}

#[test]
fn test_sp_driven_out_of_bounds_aborts_frame()
{
    let dir = TempDir::new().unwrap();
    let mut b = table_image();
    // Replace A's stream with 0x40: sp -= 4, dropping sp below the stack
    // floor. The bounds check must abort after exactly that step.
    b.put_u32(off(INDEX_START) + 4, 0x8040_b0b0);
    let image = image_from(&dir, "DDRCS0.BIN", PHYS_BASE, &b.buf);
    let translator = linear32();
    let mem = MemoryView::new(&image, &translator, false);

    let unwinder = Unwinder::probe(
        &mem,
        Some(VirtAddr::new(INDEX_START)),
        Some(VirtAddr::new(INDEX_STOP)),
        THREAD_SIZE,
    );

    let frame = FrameState::new(0, STACK, 0, FUNC_A + 0x50);
    assert!(unwinder.step(&mem, &frame).is_none());

    // The failed frame still symbolizes, but nothing follows it.
    let symbols = symbols();
    let records: Vec<String> = unwinder.backtrace(mem, &symbols, frame).map(|r| r.symbol).collect();
    assert_eq!(records, vec!["func_a".to_string()]);
}

#[test]
fn test_unindexed_pc_aborts_frame()
{
    let dir = TempDir::new().unwrap();
    let image = image_from(&dir, "DDRCS0.BIN", PHYS_BASE, &table_image().buf);
    let translator = linear32();
    let mem = MemoryView::new(&image, &translator, false);

    let unwinder = Unwinder::probe(
        &mem,
        Some(VirtAddr::new(INDEX_START)),
        Some(VirtAddr::new(INDEX_STOP)),
        THREAD_SIZE,
    );

    // A pc below every indexed function has no covering entry.
    let frame = FrameState::new(0, STACK, 0, PAGE_OFFSET + 0x10);
    assert!(unwinder.step(&mem, &frame).is_none());
}

#[test]
fn test_generic64_walk_follows_frame_records()
{
    let dir = TempDir::new().unwrap();
    let page_offset: u64 = 0xffff_ffc0_0000_0000;
    let mut b = Builder::new(0x1000);
    // Frame record at +0x10: {next_fp = 0, next_pc}.
    b.put_u64(0x10, 0);
    b.put_u64(0x18, page_offset + 0x500);
    let image = image_from(&dir, "DDRCS0.BIN", PHYS_BASE, &b.buf);
    let translator = Translator::new(
        LinearMap {
            page_offset,
            phys_offset: PHYS_BASE,
            va_bits: 64,
            kimage: None,
            linear_when_bit_clear: false,
        },
        None,
    );
    let mem = MemoryView::new(&image, &translator, true);

    let unwinder = Unwinder::probe(&mem, None, None, 16384);
    // sp sits just above the stack floor so the aligned stack top is a
    // full thread-size away.
    let frame = FrameState::new(page_offset + 0x10, page_offset + 8, 0, page_offset + 0x400);

    let next = unwinder.step(&mem, &frame).unwrap();
    assert_eq!(next.pc, page_offset + 0x500);
    assert_eq!(next.sp, page_offset + 0x20);
    // Next fp is 0: below the stack floor, so the walk halts.
    assert!(unwinder.step(&mem, &next).is_none());
}

#[test]
fn test_generic64_rejects_misaligned_fp()
{
    let dir = TempDir::new().unwrap();
    let page_offset: u64 = 0xffff_ffc0_0000_0000;
    let b = Builder::new(0x1000);
    let image = image_from(&dir, "DDRCS0.BIN", PHYS_BASE, &b.buf);
    let translator = Translator::new(
        LinearMap {
            page_offset,
            phys_offset: PHYS_BASE,
            va_bits: 64,
            kimage: None,
            linear_when_bit_clear: false,
        },
        None,
    );
    let mem = MemoryView::new(&image, &translator, true);

    let unwinder = Unwinder::probe(&mem, None, None, 16384);
    let frame = FrameState::new(page_offset + 0x18, page_offset + 8, 0, page_offset + 0x400);
    assert!(unwinder.step(&mem, &frame).is_none());
}

#[test]
fn test_generic32_bounds_guard()
{
    let dir = TempDir::new().unwrap();
    let mut b = Builder::new(0x4000);
    // Saved {fp, sp, pc} at {fp-12, fp-8, fp-4} for fp = STACK + 0x40.
    let fp = STACK + 0x40;
    b.put_u32(off(fp) - 12, 0);
    b.put_u32(off(fp) - 8, (STACK + 0x48) as u32);
    b.put_u32(off(fp) - 4, (FUNC_B + 0x10) as u32);
    let image = image_from(&dir, "DDRCS0.BIN", PHYS_BASE, &b.buf);
    let translator = linear32();
    let mem = MemoryView::new(&image, &translator, false);

    // No index symbols: generic 32-bit strategy.
    let unwinder = Unwinder::probe(&mem, None, None, THREAD_SIZE);

    let frame = FrameState::new(fp, STACK + 4, 0, FUNC_A + 0x50);
    let next = unwinder.step(&mem, &frame).unwrap();
    assert_eq!(next.pc, FUNC_B + 0x10);
    assert_eq!(next.sp, STACK + 0x48);

    // fp below sp+12 violates the guard.
    let bad = FrameState::new(STACK + 8, STACK + 4, 0, FUNC_A + 0x50);
    assert!(unwinder.step(&mem, &bad).is_none());
}
