//! # Address Translation
//!
//! Virtual-to-physical translation against the frozen page tables.
//!
//! The kernel keeps most of its own image inside a fixed-offset linear
//! mapping, so the common case is pure arithmetic. Everything else walks
//! the captured page tables, in whichever of the three descriptor formats
//! the dumped kernel was using:
//!
//! - two-level short descriptors (classic 32-bit),
//! - three-level long descriptors with a configured top-level skip (LPAE),
//! - multi-level 64-bit descriptors with a configurable VA width, where a
//!   block descriptor may terminate the walk early at an intermediate
//!   level.
//!
//! The variant is chosen once at session setup; per-call dispatch is a
//! single match. Failure is always `None`: an address that does not
//! translate is "unresolvable", never a panic, and callers substitute a
//! sentinel or skip the dependent step.

use crate::image::MemoryImage;
use crate::types::{PhysAddr, VirtAddr};

const DESC_MASK_4K: u64 = 0x0000_ffff_ffff_f000;

/// Mapping of the 64-bit kernel image region (`va - voffset = pa`).
#[derive(Debug, Clone, Copy)]
pub struct KernelImageMap
{
    /// `kimage_vaddr - phys_offset`, after relocation.
    pub voffset: u64,
}

/// Fixed-offset mapping of the kernel's linear region.
///
/// On 64-bit kernels the address space splits into a linear half and an
/// image half on the top VA bit; which half is linear flipped between
/// kernel generations, so the split side is a construction-time flag.
#[derive(Debug, Clone, Copy)]
pub struct LinearMap
{
    pub page_offset: u64,
    pub phys_offset: u64,
    pub va_bits: u32,
    pub kimage: Option<KernelImageMap>,
    /// Linear half is the one with the split bit *clear*.
    pub linear_when_bit_clear: bool,
}

impl LinearMap
{
    /// Translate a kernel virtual address by offset arithmetic alone.
    ///
    /// Returns `None` for addresses outside the statically mapped region
    /// (user space, vmalloc space on 32-bit); those need a real walk.
    pub fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr>
    {
        let va = va.value();

        let Some(kimage) = self.kimage else {
            // 32-bit: everything at or above the page offset is linear.
            if va < self.page_offset {
                return None;
            }
            return Some(PhysAddr::new(va.wrapping_sub(self.page_offset).wrapping_add(self.phys_offset)));
        };

        // 64-bit: only canonical kernel addresses are statically mapped.
        let kernel_tag = u64::MAX << self.va_bits;
        if va & kernel_tag != kernel_tag {
            return None;
        }

        let bit_set = va & (1u64 << (self.va_bits - 1)) != 0;
        let is_linear = if self.linear_when_bit_clear { !bit_set } else { bit_set };
        if is_linear {
            Some(PhysAddr::new(va.wrapping_sub(self.page_offset).wrapping_add(self.phys_offset)))
        } else {
            Some(PhysAddr::new(va.wrapping_sub(kimage.voffset)))
        }
    }

    /// Inverse mapping for physical addresses inside the linear region.
    pub fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr
    {
        VirtAddr::new(pa.value().wrapping_sub(self.phys_offset).wrapping_add(self.page_offset))
    }
}

/// Page-table geometry, probed once at session setup.
#[derive(Debug, Clone, Copy)]
pub enum PageTables
{
    /// Two-level short-descriptor format.
    NonLpae
    {
        /// Physical address of the first-level table.
        pgd: u64,
    },
    /// Three-level long-descriptor format.
    Lpae
    {
        /// Physical address of the top table (already adjusted for the
        /// skipped levels when `t1sz` calls for it).
        pgd: u64,
        /// TTBR1 split-size; 2 means the first-level lookup is skipped.
        t1sz: u32,
    },
    /// Multi-level 64-bit format with 4 KiB granule.
    V8
    {
        /// Physical address of the top table.
        pgd: u64,
        /// Virtual address width (39 and 48 are the common cases).
        va_bits: u32,
    },
}

impl PageTables
{
    fn read_u32(image: &MemoryImage, pa: u64) -> Option<u32>
    {
        let bytes = image.read_physical(PhysAddr::new(pa), 4)?;
        Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))
    }

    fn read_u64(image: &MemoryImage, pa: u64) -> Option<u64>
    {
        let bytes = image.read_physical(PhysAddr::new(pa), 8)?;
        Some(u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?))
    }

    /// Walk the page tables for `va`. `None` on any invalid or absent
    /// descriptor.
    pub fn walk(&self, image: &MemoryImage, va: VirtAddr) -> Option<PhysAddr>
    {
        let va = va.value();
        match *self {
            PageTables::NonLpae { pgd } => Self::walk_short(image, pgd, va),
            PageTables::Lpae { pgd, t1sz } => Self::walk_lpae(image, pgd, t1sz, va),
            PageTables::V8 { pgd, va_bits } => Self::walk_v8(image, pgd, va_bits, va),
        }
    }

    fn walk_short(image: &MemoryImage, pgd: u64, va: u64) -> Option<PhysAddr>
    {
        let l1_index = (va >> 20) & 0xfff;
        let desc = u64::from(Self::read_u32(image, pgd + l1_index * 4)?);

        match desc & 0x3 {
            // Coarse second-level table
            0b01 => {
                let l2_base = desc & 0xffff_fc00;
                let l2_index = (va >> 12) & 0xff;
                let pte = u64::from(Self::read_u32(image, l2_base + l2_index * 4)?);
                match pte & 0x3 {
                    // 64 KiB large page
                    0b01 => Some(PhysAddr::new((pte & 0xffff_0000) | (va & 0xffff))),
                    // 4 KiB small page (XN variant included)
                    0b10 | 0b11 => Some(PhysAddr::new((pte & 0xffff_f000) | (va & 0xfff))),
                    _ => None,
                }
            }
            // Section / supersection
            0b10 => {
                if desc & (1 << 18) != 0 {
                    Some(PhysAddr::new((desc & 0xff00_0000) | (va & 0x00ff_ffff)))
                } else {
                    Some(PhysAddr::new((desc & 0xfff0_0000) | (va & 0x000f_ffff)))
                }
            }
            _ => None,
        }
    }

    fn walk_lpae(image: &MemoryImage, pgd: u64, t1sz: u32, va: u64) -> Option<PhysAddr>
    {
        // With T1SZ == 2 the upper split leaves a single second-level page,
        // so the first-level lookup is skipped entirely.
        let pmd_base = if t1sz == 2 {
            pgd
        } else {
            let l1_index = (va >> 30) & 0x3;
            let desc = Self::read_u64(image, pgd + l1_index * 8)?;
            match desc & 0x3 {
                0b11 => desc & DESC_MASK_4K,
                // 1 GiB block
                0b01 => return Some(PhysAddr::new((desc & 0x0000_ffff_c000_0000) | (va & 0x3fff_ffff))),
                _ => return None,
            }
        };

        let l2_index = (va >> 21) & 0x1ff;
        let desc = Self::read_u64(image, pmd_base + l2_index * 8)?;
        let pte_base = match desc & 0x3 {
            0b11 => desc & DESC_MASK_4K,
            // 2 MiB block
            0b01 => return Some(PhysAddr::new((desc & 0x0000_ffff_ffe0_0000) | (va & 0x001f_ffff))),
            _ => return None,
        };

        let l3_index = (va >> 12) & 0x1ff;
        let pte = Self::read_u64(image, pte_base + l3_index * 8)?;
        if pte & 0x3 != 0b11 {
            return None;
        }
        Some(PhysAddr::new((pte & DESC_MASK_4K) | (va & 0xfff)))
    }

    fn walk_v8(image: &MemoryImage, pgd: u64, va_bits: u32, va: u64) -> Option<PhysAddr>
    {
        let index_bits = va_bits.checked_sub(12)?;
        let levels = index_bits.div_ceil(9);
        if levels == 0 {
            return None;
        }

        let mut table = pgd;
        for level in 0..levels {
            let shift = 12 + 9 * (levels - 1 - level);
            let index = (va >> shift) & 0x1ff;
            let desc = Self::read_u64(image, table + index * 8)?;

            if desc & 0x1 == 0 {
                return None;
            }
            let last = level == levels - 1;
            if desc & 0x2 == 0 {
                // Block descriptor: terminates the walk early. Only valid
                // above the leaf level.
                if last {
                    return None;
                }
                let mask = (1u64 << shift) - 1;
                return Some(PhysAddr::new((desc & DESC_MASK_4K & !mask) | (va & mask)));
            }
            if last {
                return Some(PhysAddr::new((desc & DESC_MASK_4K) | (va & 0xfff)));
            }
            table = desc & DESC_MASK_4K;
        }
        None
    }
}

/// Session-wide translator: linear shortcut first, table walk otherwise.
pub struct Translator
{
    linear: LinearMap,
    tables: Option<PageTables>,
}

impl Translator
{
    pub fn new(linear: LinearMap, tables: Option<PageTables>) -> Self
    {
        Self { linear, tables }
    }

    pub fn linear(&self) -> &LinearMap
    {
        &self.linear
    }

    /// Translate a kernel virtual address.
    ///
    /// Addresses inside the statically mapped region resolve by offset
    /// arithmetic without touching the image; everything else walks the
    /// page tables. `None` means unresolvable.
    pub fn virt_to_phys(&self, image: &MemoryImage, va: VirtAddr) -> Option<PhysAddr>
    {
        if let Some(pa) = self.linear.virt_to_phys(va) {
            return Some(pa);
        }
        self.tables.as_ref()?.walk(image, va)
    }

    /// Map a physical address back into the linear region.
    pub fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr
    {
        self.linear.phys_to_virt(pa)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn linear32() -> LinearMap
    {
        LinearMap {
            page_offset: 0xc000_0000,
            phys_offset: 0x8000_0000,
            va_bits: 32,
            kimage: None,
            linear_when_bit_clear: false,
        }
    }

    #[test]
    fn test_linear_round_trip()
    {
        let map = linear32();
        for pa in [0x8000_0000u64, 0x8123_4560, 0x9fff_fffc] {
            let va = map.phys_to_virt(PhysAddr::new(pa));
            let back = map.virt_to_phys(va).map(PhysAddr::value);
            assert_eq!(back, Some(pa));
        }
    }

    #[test]
    fn test_linear_rejects_user_addresses()
    {
        let map = linear32();
        assert!(map.virt_to_phys(VirtAddr::new(0x0000_1000)).is_none());
        assert!(map.virt_to_phys(VirtAddr::new(0xbfff_fffc)).is_none());
    }

    #[test]
    fn test_linear_64bit_split()
    {
        // 39-bit layout with the linear half on the set bit (pre-4.20
        // arrangement): page_offset covers the top half.
        let map = LinearMap {
            page_offset: 0xffff_ffc0_0000_0000,
            phys_offset: 0x8000_0000,
            va_bits: 39,
            kimage: Some(KernelImageMap {
                voffset: 0xffff_ff80_0800_0000,
            }),
            linear_when_bit_clear: false,
        };

        // Linear half: bit 38 set.
        let pa = map.virt_to_phys(VirtAddr::new(0xffff_ffc0_0000_1000));
        assert_eq!(pa.map(PhysAddr::value), Some(0x8000_1000));

        // Image half: bit 38 clear, translated through the image offset.
        let pa = map.virt_to_phys(VirtAddr::new(0xffff_ff80_0900_0000));
        assert_eq!(pa.map(PhysAddr::value), Some(0x0100_0000));

        // Non-canonical addresses stay untranslatable.
        assert!(map.virt_to_phys(VirtAddr::new(0x0000_7fff_0000_0000)).is_none());
    }
}
