//! Typed reads over the image + translator pair.
//!
//! Every component above the translator reads kernel memory through this
//! view: translate the virtual address, read the bytes out of whichever
//! segment holds them, decode little-endian. All reads are `Option`; a
//! hole or failed translation is an ordinary outcome.

use crate::image::MemoryImage;
use crate::translate::Translator;
use crate::types::{PhysAddr, VirtAddr};

/// Read-only, word-size-aware view of kernel memory.
#[derive(Clone, Copy)]
pub struct MemoryView<'a>
{
    image: &'a MemoryImage,
    translator: &'a Translator,
    arm64: bool,
}

impl<'a> MemoryView<'a>
{
    pub fn new(image: &'a MemoryImage, translator: &'a Translator, arm64: bool) -> Self
    {
        Self {
            image,
            translator,
            arm64,
        }
    }

    pub fn arm64(&self) -> bool
    {
        self.arm64
    }

    /// Native pointer width of the dumped kernel, in bytes.
    pub fn word_size(&self) -> u64
    {
        if self.arm64 {
            8
        } else {
            4
        }
    }

    pub fn image(&self) -> &'a MemoryImage
    {
        self.image
    }

    pub fn translator(&self) -> &'a Translator
    {
        self.translator
    }

    pub fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr>
    {
        self.translator.virt_to_phys(self.image, va)
    }

    pub fn read_bytes(&self, va: VirtAddr, length: usize) -> Option<Vec<u8>>
    {
        let pa = self.virt_to_phys(va)?;
        self.image.read_physical(pa, length)
    }

    pub fn read_u8(&self, va: VirtAddr) -> Option<u8>
    {
        self.read_bytes(va, 1)?.first().copied()
    }

    pub fn read_u16(&self, va: VirtAddr) -> Option<u16>
    {
        let bytes = self.read_bytes(va, 2)?;
        Some(u16::from_le_bytes(bytes.get(..2)?.try_into().ok()?))
    }

    pub fn read_u32(&self, va: VirtAddr) -> Option<u32>
    {
        let bytes = self.read_bytes(va, 4)?;
        Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))
    }

    pub fn read_u64(&self, va: VirtAddr) -> Option<u64>
    {
        let bytes = self.read_bytes(va, 8)?;
        Some(u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?))
    }

    /// Read one pointer-sized value (4 or 8 bytes by architecture).
    pub fn read_word(&self, va: VirtAddr) -> Option<u64>
    {
        if self.arm64 {
            self.read_u64(va)
        } else {
            self.read_u32(va).map(u64::from)
        }
    }

    /// Alias of [`MemoryView::read_word`] for pointer fields.
    pub fn read_pointer(&self, va: VirtAddr) -> Option<VirtAddr>
    {
        self.read_word(va).map(VirtAddr::new)
    }

    /// Read a NUL-terminated ASCII string of at most `max_length` bytes.
    ///
    /// Non-ASCII bytes are dropped, matching how corrupted task names are
    /// conventionally cleaned up in dump reports.
    pub fn read_cstring(&self, va: VirtAddr, max_length: usize) -> Option<String>
    {
        let bytes = self.read_bytes(va, max_length)?;
        let terminated = bytes.split(|byte| *byte == 0).next()?;
        Some(
            terminated
                .iter()
                .filter(|byte| byte.is_ascii())
                .map(|byte| *byte as char)
                .collect(),
        )
    }

}
