//! Entry point interface rewriting.
//!
//! SPIR-V 1.4 made the `OpEntryPoint` interface list cover every module-scope variable the entry
//! point's call tree references, not only `Input`/`Output` ones. Producers targeting older
//! versions routinely omit the rest, so the interface is rebuilt from the module's global
//! variables instead of being patched incrementally.

use tracing::debug;

use crate::asm::{id, strip_id, Assembly, Instruction};
use crate::error::PatchError;

/// Which module-scope variables belong in the interface list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfacePolicy {
    /// Every module-scope variable, regardless of whether the entry point reaches it.
    #[default]
    AllModuleVariables,
    /// Only `Input` and `Output` variables, as required before SPIR-V 1.4.
    InputOutputOnly,
}

impl InterfacePolicy {
    /// Policy matching a module of SPIR-V version `major.minor`.
    pub fn for_version(major: u8, minor: u8) -> Self {
        if (major, minor) >= (1, 4) {
            InterfacePolicy::AllModuleVariables
        } else {
            InterfacePolicy::InputOutputOnly
        }
    }

    fn admits(self, storage_class: &str) -> bool {
        match self {
            InterfacePolicy::AllModuleVariables => storage_class != "Function",
            InterfacePolicy::InputOutputOnly => matches!(storage_class, "Input" | "Output"),
        }
    }
}

/// Result names of module-scope `OpVariable`s admitted by `policy`, in module order.
pub fn module_scope_variables(asm: &Assembly, policy: InterfacePolicy) -> Vec<String> {
    asm.instructions()[..asm.module_scope_end()]
        .iter()
        .filter(|inst| inst.is("OpVariable"))
        .filter(|inst| inst.operand(1).is_some_and(|class| policy.admits(class)))
        .filter_map(|inst| inst.result.clone())
        .collect()
}

/// Name of the function declared by the first `OpEntryPoint`.
pub fn entry_function(asm: &Assembly) -> Result<String, PatchError> {
    let pos = asm
        .position("OpEntryPoint")
        .ok_or(PatchError::MissingInstruction("OpEntryPoint"))?;
    asm.instructions()[pos]
        .operand(1)
        .and_then(strip_id)
        .map(str::to_owned)
        .ok_or_else(|| PatchError::MalformedInstruction {
            position: pos,
            reason: "OpEntryPoint without an entry function id".into(),
        })
}

/// Replaces the first `OpEntryPoint` with one whose interface lists `view_index` (when given)
/// followed by every module-scope variable admitted by `policy`.
///
/// Execution model, entry function and entry name are carried over unchanged.
pub fn rewrite_entry_point(
    asm: &mut Assembly,
    view_index: Option<&str>,
    policy: InterfacePolicy,
) -> Result<(), PatchError> {
    let pos = asm
        .position("OpEntryPoint")
        .ok_or(PatchError::MissingInstruction("OpEntryPoint"))?;
    let entry = &asm.instructions()[pos];
    if entry.operands.len() < 3 || !entry.operands[2].starts_with('"') {
        return Err(PatchError::MalformedInstruction {
            position: pos,
            reason: "OpEntryPoint needs an execution model, a function and a name".into(),
        });
    }

    let mut operands = entry.operands[..3].to_vec();
    let interface_start = operands.len();
    let names = view_index
        .map(str::to_owned)
        .into_iter()
        .chain(module_scope_variables(asm, policy));
    for name in names {
        let operand = id(&name);
        if !operands[interface_start..].contains(&operand) {
            operands.push(operand);
        }
    }

    debug!(
        interface_len = operands.len() - interface_start,
        ?policy,
        "rewrote entry point interface"
    );
    asm.replace(pos, Instruction::new("OpEntryPoint", operands))
}
