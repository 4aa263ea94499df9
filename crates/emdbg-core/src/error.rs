//! # Error Types
//!
//! Error handling for the debug-information engine.
//!
//! We use `thiserror` to generate `Error` trait implementations and readable
//! messages. Every fallible operation in this crate returns [`EmdbgResult`].
//!
//! ## Error Categories
//!
//! 1. **Decoding errors**: the input sections are truncated or malformed
//!    (`UnexpectedEof`, `Malformed`, `NotADie`, `AbbreviationNotFound`)
//! 2. **Unsupported input**: valid DWARF this engine deliberately rejects
//!    (`UnsupportedForm`, `Dwarf64Unsupported`, `UnsupportedOpcode`, ...)
//! 3. **Unavailable data**: the target could not supply a value at run time
//!    (`MemoryUnavailable`, `RegisterUnavailable`, `FrameUnavailable`,
//!    `CfaUnavailable`, `FrameBaseUnavailable`, `EntryValueUnavailable`). These are recoverable; see
//!    [`EmdbgError::is_unavailable`].
//! 4. **Evaluation errors**: the stack machine could not finish a program

use gimli::{DwForm, DwOp, DwTag};
use thiserror::Error;

/// Main error type for debug-information operations
#[derive(Error, Debug)]
pub enum EmdbgError
{
    /// A read ran past the end of a section
    #[error("Unexpected end of {section} at offset 0x{offset:x}")]
    UnexpectedEof
    {
        /// Section being decoded (".debug_info", ".debug_line", ...)
        section: &'static str,
        /// Offset of the failed read within that section
        offset: usize,
    },

    /// Section contents violate the DWARF encoding rules
    #[error("Malformed {section} at offset 0x{offset:x}: {reason}")]
    Malformed
    {
        /// Section being decoded
        section: &'static str,
        /// Offset at which the problem was detected
        offset: usize,
        /// Human readable description
        reason: String,
    },

    /// Attribute form this engine cannot decode
    #[error("Unsupported attribute form {0}")]
    UnsupportedForm(DwForm),

    /// Only DWARF versions 2 through 5 are understood
    #[error("Unsupported DWARF version {0}")]
    UnsupportedDwarfVersion(u16),

    /// The 64-bit DWARF format (initial length `0xffffffff`) was encountered
    #[error("64-bit DWARF is not supported (unit at offset 0x{0:x})")]
    Dwarf64Unsupported(usize),

    /// Only 4-byte target addresses are supported
    #[error("Unsupported address size {0}")]
    UnsupportedAddressSize(u8),

    /// A DIE referenced an abbreviation code missing from its table
    #[error("Abbreviation code {code} not found in table at offset 0x{table:x}")]
    AbbreviationNotFound
    {
        /// Abbreviation code read from `.debug_info`
        code: u64,
        /// Offset of the abbreviation table in `.debug_abbrev`
        table: u32,
    },

    /// The offset does not name a debugging information entry
    #[error("Offset 0x{0:x} is not the start of a debugging information entry")]
    NotADie(u32),

    /// `.debug_frame` CIE version other than 1, 3 or 4
    #[error("Unsupported CIE version {0}")]
    UnsupportedCieVersion(u8),

    /// `.debug_frame` CIE augmentation other than `""` or `"armcc+"`
    #[error("Unsupported CIE augmentation {0:?}")]
    UnsupportedAugmentation(String),

    /// DWARF expression opcode the compiler cannot translate
    #[error("Unsupported DWARF expression opcode {opcode} at offset {offset}")]
    UnsupportedOpcode
    {
        /// The opcode
        opcode: DwOp,
        /// Offset of the opcode within the expression block
        offset: usize,
    },

    /// Call frame instruction the unwinder cannot translate
    #[error("Unsupported call frame instruction 0x{0:02x}")]
    UnsupportedCfaOpcode(u8),

    /// `DW_OP_bra`/`DW_OP_skip` with a backward displacement
    #[error("Backward branch ({0}) in DWARF expression is not supported")]
    NegativeBranch(i16),

    /// A second branch while a forward branch is still pending
    #[error("Nested branch in DWARF expression is not supported")]
    NestedBranch,

    /// A type graph node whose tag cannot be rendered
    #[error("Cannot render type node with tag {0}")]
    UnhandledTag(DwTag),

    /// Target memory could not be read
    #[error("Target memory unavailable: {length} bytes at 0x{address:08x}")]
    MemoryUnavailable
    {
        /// First address of the failed read
        address: u32,
        /// Number of bytes requested
        length: usize,
    },

    /// Register value could not be obtained
    #[error("Register r{0} unavailable")]
    RegisterUnavailable(u32),

    /// The register cache holds no such frame
    #[error("Register frame #{0} unavailable")]
    FrameUnavailable(usize),

    /// The canonical frame address needs the caller's frame, which has not
    /// been unwound
    #[error("Canonical frame address unavailable")]
    CfaUnavailable,

    /// `DW_AT_frame_base` of the enclosing function could not be evaluated
    #[error("Frame base unavailable")]
    FrameBaseUnavailable,

    /// `DW_OP_entry_value` could not be resolved through a call site
    #[error("Entry value unavailable: {0}")]
    EntryValueUnavailable(String),

    /// Run-control request the current target does not implement
    #[error("Target operation not supported: {0}")]
    TargetOperationUnsupported(&'static str),

    /// Stack machine popped from an empty stack
    #[error("Stack underflow executing {0}")]
    StackUnderflow(String),

    /// Any other failure while executing a compiled program
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// I/O error (reading images, register dumps, ...)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmdbgError
{
    /// Whether this error means "the value is not available right now"
    ///
    /// Unavailable data is not a defect in the debug information. Callers
    /// usually render it as `<unavailable>` or `??` and carry on.
    pub fn is_unavailable(&self) -> bool
    {
        matches!(
            self,
            EmdbgError::MemoryUnavailable { .. }
                | EmdbgError::RegisterUnavailable(_)
                | EmdbgError::FrameUnavailable(_)
                | EmdbgError::CfaUnavailable
                | EmdbgError::FrameBaseUnavailable
                | EmdbgError::EntryValueUnavailable(_)
        )
    }

    pub(crate) fn malformed(section: &'static str, offset: usize, reason: impl Into<String>) -> Self
    {
        EmdbgError::Malformed {
            section,
            offset,
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for `Result<T, EmdbgError>`
///
/// ```rust
/// use emdbg_core::error::EmdbgResult;
/// fn foo() -> EmdbgResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type EmdbgResult<T> = std::result::Result<T, EmdbgError>;
