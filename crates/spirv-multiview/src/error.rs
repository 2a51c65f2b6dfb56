use thiserror::Error;

use crate::asm::Section;
use crate::classify::ShaderFlavor;
use crate::toolchain::ToolchainError;

/// Precondition and consistency failures of the instruction-level patching engine.
///
/// Every component checks its preconditions before touching the sequence, so a `PatchError`
/// always leaves the [`crate::asm::Assembly`] it was raised for unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("module has no OpString shader marker")]
    MissingDebugString,
    #[error("module has no {0} instruction")]
    MissingInstruction(&'static str),
    #[error("entry function %{0} is not defined")]
    MissingEntryFunction(String),
    #[error("required definition %{0} is missing")]
    MissingDefinition(String),
    #[error(
        "matrix access at position {position} is in function %{function}, where the view offsets \
         computed in the entry function are not available"
    )]
    AccessOutsideEntryFunction { function: String, position: usize },
    #[error("result %{0} is defined more than once")]
    DuplicateResult(String),
    #[error("assembly line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("malformed instruction at position {position}: {reason}")]
    MalformedInstruction { position: usize, reason: String },
    #[error("{opcode} at position {position} belongs to section {section:?}, which must precede {previous:?}")]
    LayoutViolation {
        position: usize,
        opcode: String,
        section: Section,
        previous: Section,
    },
}

/// Boundary error for the binary-in/binary-out operations.
///
/// Any variant aborts the whole invocation; no output is produced.
#[derive(Debug, Error)]
pub enum MultiviewError {
    #[error("disassembly failed: {0}")]
    Disassembly(#[source] ToolchainError),
    #[error("shader classification failed: {0}")]
    Classification(#[source] PatchError),
    #[error("{operation} does not accept {flavor:?} shaders")]
    UnsupportedFlavor {
        flavor: ShaderFlavor,
        operation: &'static str,
    },
    #[error("optimization failed: {0}")]
    Optimization(#[source] ToolchainError),
    #[error("reassembly failed: {0}")]
    Reassembly(#[source] ToolchainError),
    #[error("validation failed: {0}")]
    Validation(#[source] ToolchainError),
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),
}
