//! Physical and virtual address types.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed physical address
///
/// A physical address indexes into the captured RAM segments. Keeping it as
/// a distinct type from [`VirtAddr`] prevents the classic dump-parser bug of
/// handing an untranslated kernel pointer to a segment read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr
{
    /// Create a new physical address from a raw `u64` value.
    pub const fn new(value: u64) -> Self
    {
        PhysAddr(value)
    }

    /// Get the raw `u64` value of this address.
    pub const fn value(self) -> u64
    {
        self.0
    }
}

impl From<u64> for PhysAddr
{
    fn from(value: u64) -> Self
    {
        PhysAddr(value)
    }
}

impl fmt::Display for PhysAddr
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl Add<u64> for PhysAddr
{
    type Output = PhysAddr;

    fn add(self, rhs: u64) -> Self::Output
    {
        PhysAddr(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for PhysAddr
{
    type Output = PhysAddr;

    fn sub(self, rhs: u64) -> Self::Output
    {
        PhysAddr(self.0.wrapping_sub(rhs))
    }
}

/// Strongly typed kernel virtual address
///
/// Everything read out of kernel data structures (list pointers, stack
/// pointers, saved registers) is a virtual address and must go through the
/// session translator before it can be read from the image.
///
/// ## Example
///
/// ```rust
/// use ramscope_core::types::VirtAddr;
///
/// let addr = VirtAddr::new(0xffff_ffc0_0000_1000);
/// let next = addr + 0x100;
/// assert_eq!(next.value(), 0xffff_ffc0_0000_1100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u64);

impl VirtAddr
{
    /// The null address (0x0), usable as a sentinel.
    pub const ZERO: Self = VirtAddr(0);

    /// Create a new virtual address from a raw `u64` value.
    pub const fn new(value: u64) -> Self
    {
        VirtAddr(value)
    }

    /// Get the raw `u64` value of this address.
    pub const fn value(self) -> u64
    {
        self.0
    }
}

impl From<u64> for VirtAddr
{
    fn from(value: u64) -> Self
    {
        VirtAddr(value)
    }
}

impl fmt::Display for VirtAddr
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl Add<u64> for VirtAddr
{
    type Output = VirtAddr;

    fn add(self, rhs: u64) -> Self::Output
    {
        VirtAddr(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for VirtAddr
{
    type Output = VirtAddr;

    fn sub(self, rhs: u64) -> Self::Output
    {
        VirtAddr(self.0.wrapping_sub(rhs))
    }
}
