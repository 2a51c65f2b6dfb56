use tracing::debug;

use crate::asm::{ops, Assembly, Instruction};
use crate::error::PatchError;

pub const MULTIVIEW_CAPABILITY: &str = "MultiView";

/// Ensures the module declares `OpCapability MultiView`.
///
/// The declaration is placed first, ahead of every other capability. Returns `false` when the
/// capability was already declared and the module is left untouched.
pub fn add_multiview_capability(asm: &mut Assembly) -> Result<bool, PatchError> {
    let declared = asm
        .iter()
        .take_while(|inst| inst.is("OpCapability"))
        .any(|inst| inst.operand(0) == Some(MULTIVIEW_CAPABILITY));
    if declared {
        return Ok(false);
    }

    asm.insert(
        0,
        Instruction::new("OpCapability", ops([MULTIVIEW_CAPABILITY])),
    )?;
    debug!("declared MultiView capability");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn inserts_capability_first() {
        let mut asm =
            Assembly::parse("OpCapability Shader\nOpMemoryModel Logical GLSL450\n").unwrap();
        assert!(add_multiview_capability(&mut asm).unwrap());
        assert_eq!(
            asm.to_text(),
            "OpCapability MultiView\nOpCapability Shader\nOpMemoryModel Logical GLSL450\n"
        );
        asm.check_layout().unwrap();
    }

    #[test]
    fn is_idempotent() {
        let mut asm =
            Assembly::parse("OpCapability Shader\nOpMemoryModel Logical GLSL450\n").unwrap();
        add_multiview_capability(&mut asm).unwrap();
        let once = asm.clone();
        assert!(!add_multiview_capability(&mut asm).unwrap());
        assert_eq!(asm, once);
    }

    #[test]
    fn existing_declaration_in_capability_block_is_kept() {
        let text = "OpCapability Shader\nOpCapability MultiView\nOpMemoryModel Logical GLSL450\n";
        let mut asm = Assembly::parse(text).unwrap();
        assert!(!add_multiview_capability(&mut asm).unwrap());
        assert_eq!(asm.to_text(), text);
    }
}
