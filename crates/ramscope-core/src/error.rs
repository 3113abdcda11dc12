//! # Error Types
//!
//! General error handling for the analysis engine.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! Most primitives in this crate signal failure by returning `None`: an
//! unreadable word, an untranslatable address or an unresolvable symbol is
//! ordinary in a crash dump and the enclosing component decides whether to
//! substitute a default, skip a sub-step or halt that one sub-analysis.
//! `AnalysisError` is reserved for the places where a *reason* has to travel
//! upward: session setup (where nothing can proceed) and component-level
//! aborts that the caller reports to the user.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for analysis operations
///
/// ## Error Categories
///
/// 1. **Setup errors** (fatal to the run): `NoSegments`, `NoSymbols`,
///    `VersionMismatch`, `Setup`
/// 2. **Degradation markers** (local to one sub-analysis): `UnresolvedSymbol`,
///    `InvalidTranslation`, `CorruptStructure`, `MissingDebugField`,
///    `OutOfRangeRead`, `UnwindAbort`
/// 3. **I/O errors**: `Io` (for dump segment and vmlinux file access)
#[derive(Error, Debug)]
pub enum AnalysisError
{
    /// No usable memory segments could be loaded from the dump manifest.
    ///
    /// Without at least one segment there is nothing to analyze, so this is
    /// fatal to the whole session.
    #[error("no memory segments found under {0}")]
    NoSegments(PathBuf),

    /// The kernel symbol table came up empty.
    ///
    /// This usually means the supplied vmlinux is stripped or does not match
    /// the dump at all.
    #[error("unable to retrieve any symbols from {0}")]
    NoSymbols(PathBuf),

    /// The version banner read out of the dump does not match the vmlinux.
    #[error("version banner mismatch: vmlinux has {vmlinux:?}, dump has {dump:?}")]
    VersionMismatch
    {
        /// Banner compiled into the supplied vmlinux
        vmlinux: String,
        /// Banner found in the memory image (`None` when unreadable)
        dump: Option<String>,
    },

    /// A session-setup step failed in a way that makes analysis impossible.
    ///
    /// Examples: the page-table geometry could not be probed, or the kernel
    /// version could not be extracted from the banner.
    #[error("session setup failed: {0}")]
    Setup(String),

    /// A name could not be resolved against the symbol table.
    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// A virtual address did not translate to any physical address.
    #[error("no translation for virtual address 0x{0:016x}")]
    InvalidTranslation(u64),

    /// A kernel data structure failed validation while being traversed.
    #[error("corrupt structure at 0x{addr:016x}: {reason}")]
    CorruptStructure
    {
        /// Address of the offending node
        addr: u64,
        /// What the validation found
        reason: String,
    },

    /// Debug metadata required by a sub-step is absent from this build.
    #[error("missing debug field: {type_name}.{field}")]
    MissingDebugField
    {
        /// C type the field belongs to (e.g. `struct task_struct`)
        type_name: String,
        /// Field name that could not be resolved
        field: String,
    },

    /// A physical read fell outside every loaded segment.
    #[error("physical read at 0x{0:016x} is outside all segments")]
    OutOfRangeRead(u64),

    /// Unwinding aborted for one frame (bad instruction, sp out of bounds...).
    #[error("unwind aborted: {0}")]
    UnwindAbort(String),

    /// I/O error (for file operations, etc.)
    ///
    /// Used for errors when reading dump segments or the vmlinux.
    /// This is a standard Rust `std::io::Error` converted to our error type.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, AnalysisError>`
///
/// ```rust
/// use ramscope_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, AnalysisError>;
