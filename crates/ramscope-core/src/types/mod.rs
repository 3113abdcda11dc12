//! # Types
//!
//! Shared types used throughout the analysis engine.
//!
//! These keep the two address spaces (captured physical RAM vs. kernel
//! virtual addresses) apart and carry the small value types that cross
//! component boundaries.

pub mod address;
pub mod task;

// Re-export all public types
pub use address::{PhysAddr, VirtAddr};
pub use task::{task_state_char, TaskHandle};
