//! SPIR-V multiview patching for shaders emitted by the D3D9 translation layer.
//!
//! The translation layer produces single-view SPIR-V. Rendering stereo (or any multiview) output
//! needs each vertex shader to read the per-view copy of its transform matrix, which lives at a
//! view-dependent offset in the constant array. This crate patches such modules at the assembly
//! text level:
//!
//! - [`asm`]: ordered instruction sequence with definition tracking and fresh-name generation.
//! - [`classify`]: shader flavor from the module's `OpString` marker.
//! - [`capability`], [`entry_point`], [`matrix`]: the individual edits.
//! - [`toolchain`]: SPIRV-Tools façade (disassemble, assemble, validate, optimize).
//! - [`pipeline`]: the binary-in/binary-out operations built from the above.

pub mod asm;
pub mod capability;
pub mod classify;
pub mod config;
pub mod entry_point;
pub mod error;
pub mod matrix;
pub mod pipeline;
pub mod toolchain;

#[cfg(test)]
mod test_fixtures;

pub use asm::{Assembly, Instruction};
pub use classify::ShaderFlavor;
pub use config::{ConfigError, PatchConfig, ToolchainConfig};
pub use error::{MultiviewError, PatchError};
pub use matrix::{MatrixAccessPattern, ViewOffsets};
pub use pipeline::{MultiviewPatcher, RelocateOptions};
pub use toolchain::{Diagnostic, DiagnosticSink, SpirvTools, Toolchain, ToolchainError};
