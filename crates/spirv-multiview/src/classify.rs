//! Shader flavor detection.
//!
//! The D3D9 translation layer tags every SPIR-V module it emits with an `OpString` whose text
//! identifies how the shader was produced. Only the first `OpString` is consulted.

use tracing::debug;

use crate::asm::{unquote, Assembly};
use crate::error::PatchError;

/// Marker prefix of translated programmable vertex shaders.
pub const VERTEX_MARKER: &str = "VS_";
/// Marker prefix of fixed-function vertex shaders.
pub const FIXED_FUNCTION_VERTEX_MARKER: &str = "FF_VS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderFlavor {
    /// Translated vertex shader; receives the full multiview patch.
    Vertex,
    /// Fixed-function vertex shader; the translation layer already emits multiview-aware code.
    FixedFunctionVertex,
    /// Any other stage or producer.
    Other,
}

impl ShaderFlavor {
    pub fn from_marker(marker: &str) -> Self {
        if marker.starts_with(VERTEX_MARKER) {
            ShaderFlavor::Vertex
        } else if marker.starts_with(FIXED_FUNCTION_VERTEX_MARKER) {
            ShaderFlavor::FixedFunctionVertex
        } else {
            ShaderFlavor::Other
        }
    }
}

/// Classifies `asm` from its first `OpString`.
///
/// Returns [`PatchError::MissingDebugString`] when the module carries no marker at all; callers
/// must treat that as "cannot patch" rather than guess.
pub fn classify(asm: &Assembly) -> Result<ShaderFlavor, PatchError> {
    let (position, marker) = asm
        .iter()
        .enumerate()
        .find(|(_, inst)| inst.is("OpString"))
        .ok_or(PatchError::MissingDebugString)?;

    let text = marker
        .operand(0)
        .and_then(unquote)
        .ok_or_else(|| PatchError::MalformedInstruction {
            position,
            reason: "OpString without a string literal".into(),
        })?;

    let flavor = ShaderFlavor::from_marker(&text);
    debug!(marker = %text, ?flavor, "classified shader");
    Ok(flavor)
}
