//! # ramscope-core
//!
//! Post-mortem kernel-memory forensics engine.
//!
//! Given a frozen snapshot of a crashed system's physical RAM plus the
//! matching vmlinux, this crate reconstructs live kernel state:
//! - physical-address reads over the captured segments ([`image`])
//! - virtual-to-physical translation against the frozen page tables
//!   ([`translate`])
//! - symbol resolution over a sorted address index ([`symbols`])
//! - call-stack reconstruction, table-driven or frame-pointer based
//!   ([`unwind`])
//! - corruption-tolerant traversal of kernel linked lists ([`walker`])
//! - the analyses composed from all of the above ([`analyses`])
//!
//! Everything runs single-threaded over one immutable memory snapshot.
//! The memory is untrusted: primitives return `Option` and components
//! degrade locally instead of aborting the run.

pub mod analyses;
pub mod debuginfo;
pub mod error;
pub mod image;
pub mod mem;
pub mod report;
pub mod session;
pub mod symbols;
pub mod translate;
pub mod types;
pub mod unwind;
pub mod walker;

// Re-export commonly used types
pub use error::{AnalysisError, Result};
pub use session::{Session, SessionConfig};
