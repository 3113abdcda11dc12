//! Shared scaffolding for the integration tests: synthetic dump segments
//! written to temp files plus a 32-bit linear translator.
#![allow(dead_code)]

use std::path::PathBuf;

use ramscope_core::image::{MemoryImage, MemorySegment};
use ramscope_core::translate::{LinearMap, Translator};
use tempfile::TempDir;

pub const PHYS_BASE: u64 = 0x8000_0000;
pub const PAGE_OFFSET: u64 = 0xc000_0000;

/// Little-endian scratch buffer for laying out synthetic kernel memory.
pub struct Builder
{
    pub buf: Vec<u8>,
}

impl Builder
{
    pub fn new(size: usize) -> Self
    {
        Self { buf: vec![0u8; size] }
    }

    pub fn put_u32(&mut self, offset: usize, value: u32)
    {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, offset: usize, value: u64)
    {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8])
    {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// Write `bytes` as a segment file and build a one-segment image at `base`.
pub fn image_from(dir: &TempDir, name: &str, base: u64, bytes: &[u8]) -> MemoryImage
{
    let path: PathBuf = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    let source = name.rsplit_once('.').map_or(name, |(stem, _)| stem).to_string();
    MemoryImage::new(vec![MemorySegment::new(
        path,
        base,
        base + bytes.len() as u64 - 1,
        source,
    )])
}

/// Translator with the classic 32-bit linear map and no page tables.
pub fn linear32() -> Translator
{
    Translator::new(
        LinearMap {
            page_offset: PAGE_OFFSET,
            phys_offset: PHYS_BASE,
            va_bits: 32,
            kimage: None,
            linear_when_bit_clear: false,
        },
        None,
    )
}
