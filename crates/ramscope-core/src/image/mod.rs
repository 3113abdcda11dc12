//! # Memory Image
//!
//! Read-only access to the captured physical RAM of the crashed system.
//!
//! A dump session consists of one or more binary segment files, each
//! covering a contiguous physical address range. The image keeps them
//! sorted by start address and answers range reads against whichever
//! segment contains the requested address. A read that falls into no
//! segment is a *hole*, reported as `None`; callers zero-fill or skip,
//! they do not treat it as an error.
//!
//! File handles are opened lazily on first access and stay open for the
//! session. Seek-then-read is not atomic, so the image is intentionally
//! not shareable across threads; the whole analysis runs single-threaded
//! over one immutable snapshot.

pub mod manifest;

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::types::PhysAddr;

/// One contiguous physical-address range backed by a segment file.
///
/// Immutable after construction; the only interior state is the lazily
/// opened file handle.
#[derive(Debug)]
pub struct MemorySegment
{
    path: PathBuf,
    handle: RefCell<Option<File>>,
    start: u64,
    /// Inclusive end address (`start + file_size - 1`).
    end: u64,
    source: String,
}

impl MemorySegment
{
    pub fn new(path: PathBuf, start: u64, end: u64, source: String) -> Self
    {
        Self {
            path,
            handle: RefCell::new(None),
            start,
            end,
            source,
        }
    }

    pub fn start(&self) -> u64
    {
        self.start
    }

    pub fn end(&self) -> u64
    {
        self.end
    }

    pub fn source(&self) -> &str
    {
        &self.source
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    fn contains(&self, addr: u64) -> bool
    {
        addr >= self.start && addr <= self.end
    }

    /// Read up to `length` bytes starting at physical address `addr`.
    ///
    /// The caller guarantees `addr` lies inside this segment; the read is
    /// clamped at the end of the backing file, so it may come back short.
    fn read(&self, addr: u64, length: usize) -> Option<Vec<u8>>
    {
        let mut guard = self.handle.borrow_mut();
        if guard.is_none() {
            match File::open(&self.path) {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    warn!("could not open segment {}: {err}", self.path.display());
                    return None;
                }
            }
        }
        let file = guard.as_mut()?;

        let offset = addr - self.start;
        file.seek(SeekFrom::Start(offset)).ok()?;

        let mut buf = Vec::with_capacity(length);
        file.take(length as u64).read_to_end(&mut buf).ok()?;
        if buf.is_empty() {
            return None;
        }
        Some(buf)
    }
}

/// Ordered, immutable set of memory segments.
#[derive(Debug)]
pub struct MemoryImage
{
    segments: Vec<MemorySegment>,
}

impl MemoryImage
{
    /// Build an image from segments, sorting them ascending by start address.
    pub fn new(mut segments: Vec<MemorySegment>) -> Self
    {
        segments.sort_by_key(MemorySegment::start);
        Self { segments }
    }

    pub fn is_empty(&self) -> bool
    {
        self.segments.is_empty()
    }

    /// Read `length` bytes at a physical address.
    ///
    /// Locates the single segment whose range contains `addr`; returns
    /// `None` when no segment covers the start address. Reads never span
    /// two segments.
    pub fn read_physical(&self, addr: PhysAddr, length: usize) -> Option<Vec<u8>>
    {
        let addr = addr.value();
        let idx = self.segments.partition_point(|seg| seg.start <= addr);
        if idx == 0 {
            return None;
        }
        let segment = &self.segments[idx - 1];
        if !segment.contains(addr) {
            return None;
        }
        segment.read(addr, length)
    }

    /// All `(start, end, source)` triples, for bounds checking ahead of
    /// direct reads.
    pub fn extents(&self) -> Vec<(PhysAddr, PhysAddr, &str)>
    {
        self.segments
            .iter()
            .map(|seg| (PhysAddr::new(seg.start), PhysAddr::new(seg.end), seg.source.as_str()))
            .collect()
    }

    /// Lowest start address across all segments.
    pub fn lowest_start(&self) -> Option<u64>
    {
        self.segments.first().map(MemorySegment::start)
    }

    /// Physical span `[base, end]` covered by DDR segments.
    ///
    /// DDR segments are what the kernel image itself is loaded into, so
    /// they are prioritized when deriving the base physical offset.
    pub fn ddr_bounds(&self) -> Option<(u64, u64)>
    {
        let mut base: Option<u64> = None;
        let mut end: Option<u64> = None;
        for seg in &self.segments {
            if !seg.source.to_ascii_uppercase().contains("DDR") {
                continue;
            }
            base = Some(base.map_or(seg.start, |b| b.min(seg.start)));
            end = Some(end.map_or(seg.end, |e| e.max(seg.end)));
        }
        Some((base?, end?))
    }

    /// Base physical offset for the session: the lowest DDR segment start,
    /// falling back to the lowest segment start for dumps without DDR
    /// naming.
    pub fn base_phys_offset(&self) -> Option<u64>
    {
        self.ddr_bounds().map(|(base, _)| base).or_else(|| self.lowest_start())
    }
}
