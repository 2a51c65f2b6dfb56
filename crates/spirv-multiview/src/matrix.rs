//! View-shifted matrix access rewriting.
//!
//! The D3D9 translation layer feeds vertex shader constants (`c#`) through one uniform array of
//! `vec4`s. For multiview rendering the per-view copies of a matrix live further along that array,
//! `4` float slots per view past `base_offset`. This module injects the `ViewIndex` built-in,
//! computes the shifted row indices once at the top of the entry function, and points every
//! static access to the matrix rows at them:
//!
//! ```text
//! data_offset = base_offset + view_index * 4
//! i_f{f}_{k}  = data_offset + (f + k)          k in 0..4
//! ```

use tracing::debug;

use crate::asm::{id, ops, strip_id, Assembly, Instruction};
use crate::entry_point::entry_function;
use crate::error::PatchError;

/// Constants the producer is expected to have declared already.
const REQUIRED_DEFINITIONS: [&str; 6] = ["uint", "uint_0", "uint_1", "uint_2", "uint_3", "uint_4"];

/// Opcodes allowed between a block's `OpLabel` and its first real instruction.
const BLOCK_PREAMBLE: [&str; 3] = ["OpVariable", "OpLine", "OpNoLine"];

/// Caller-supplied offsets describing where the per-view matrix data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewOffsets {
    /// First row index (in `vec4` units) of the matrix inside the constant array.
    pub field_index: u32,
    /// Slot index where the per-view data begins.
    pub base_offset: u32,
}

/// Shape of the access chains that address the constant array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAccessPattern {
    /// Result type of the access chain (without `%`).
    pub pointer_type: String,
    /// Uniform block variable holding the constant array.
    pub base: String,
    /// Struct member index operand selecting the array.
    pub member: String,
    /// Prefix of the constant naming the static row index (`int_` for `%int_5`).
    pub row_prefix: String,
}

impl Default for MatrixAccessPattern {
    fn default() -> Self {
        Self {
            pointer_type: "_ptr_Uniform_v4float".into(),
            base: "c".into(),
            member: "uint_1".into(),
            row_prefix: "int_".into(),
        }
    }
}

impl MatrixAccessPattern {
    /// Whether `inst` is an access chain reading row `row` of the constant array.
    pub fn matches(&self, inst: &Instruction, row: u32) -> bool {
        if !inst.is("OpAccessChain") || inst.operands.len() != 4 {
            return false;
        }
        let ids: Vec<&str> = inst.operands.iter().filter_map(|op| strip_id(op)).collect();
        match ids.as_slice() {
            [ty, base, member, index] => {
                *ty == self.pointer_type
                    && *base == self.base
                    && *member == self.member
                    && index
                        .strip_prefix(self.row_prefix.as_str())
                        .and_then(|n| n.parse::<u32>().ok())
                        == Some(row)
            }
            _ => false,
        }
    }
}

/// What [`patch_matrix_accesses`] added to the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixPatchReport {
    /// Every result name introduced, in insertion order.
    pub inserted: Vec<String>,
    /// Names of the four shifted row indices.
    pub row_values: [String; 4],
    /// Number of access chains rewritten per row.
    pub rewritten: [usize; 4],
}

impl MatrixPatchReport {
    pub fn total_rewritten(&self) -> usize {
        self.rewritten.iter().sum()
    }
}

/// Rewrites static accesses to rows `field_index..field_index + 4` of the constant array so they
/// read the copy belonging to the current view.
///
/// `view_index` names the `Input` variable to create; reserve it with
/// [`Assembly::fresh_name`] when the entry point has to reference it first.
///
/// All preconditions are checked before the module is modified.
pub fn patch_matrix_accesses(
    asm: &mut Assembly,
    offsets: ViewOffsets,
    pattern: &MatrixAccessPattern,
    view_index: &str,
) -> Result<MatrixPatchReport, PatchError> {
    for name in REQUIRED_DEFINITIONS {
        asm.require_defined(name)?;
    }
    let decorate = asm
        .position("OpDecorate")
        .ok_or(PatchError::MissingInstruction("OpDecorate"))?;
    let entry = entry_function(asm)?;
    entry_body_start(asm, &entry)?;
    check_accesses_in_entry(asm, &entry, offsets.field_index, pattern)?;

    let view_index_id = id(view_index);
    let mut inserted = Vec::new();

    asm.insert(
        decorate,
        Instruction::new(
            "OpDecorate",
            ops([view_index_id.as_str(), "BuiltIn", "ViewIndex"]),
        ),
    )?;

    // Globals go at the end of the module-scope section, where `%uint` is already declared.
    let existing_ptr = asm
        .iter()
        .find(|inst| {
            inst.is("OpTypePointer")
                && inst.operands.iter().map(String::as_str).eq(["Input", "%uint"])
        })
        .and_then(|inst| inst.result.clone());
    let mut globals = Vec::new();
    let ptr = match existing_ptr {
        Some(ptr) => ptr,
        None => {
            let ptr = asm.fresh_name("_ptr_Input_uint");
            globals.push(Instruction::with_result(
                &ptr,
                "OpTypePointer",
                ops(["Input", "%uint"]),
            ));
            ptr
        }
    };
    let base_const = asm.fresh_name("shader_data_begin");
    let field_const = asm.fresh_name("f_idx");
    globals.push(Instruction::with_result(
        view_index,
        "OpVariable",
        ops([id(&ptr).as_str(), "Input"]),
    ));
    globals.push(Instruction::with_result(
        &base_const,
        "OpConstant",
        ops(["%uint", offsets.base_offset.to_string().as_str()]),
    ));
    globals.push(Instruction::with_result(
        &field_const,
        "OpConstant",
        ops(["%uint", offsets.field_index.to_string().as_str()]),
    ));
    inserted.extend(globals.iter().filter_map(|inst| inst.result.clone()));
    let globals_end = asm.module_scope_end();
    asm.insert_all(globals_end, globals)?;

    let vi = asm.fresh_name("vi");
    let view_offset = asm.fresh_name("view_offset");
    let data_offset = asm.fresh_name("data_offset");
    let data_offset_id = id(&data_offset);
    let mut body = vec![
        Instruction::with_result(&vi, "OpLoad", ops(["%uint", view_index_id.as_str()])),
        Instruction::with_result(
            &view_offset,
            "OpIMul",
            ops(["%uint", id(&vi).as_str(), "%uint_4"]),
        ),
        Instruction::with_result(
            &data_offset,
            "OpIAdd",
            ops(["%uint", id(&base_const).as_str(), id(&view_offset).as_str()]),
        ),
    ];

    let field_index = offsets.field_index;
    let row_values: [String; 4] =
        std::array::from_fn(|row| asm.fresh_name(&format!("i_f{field_index}_{row}")));
    if field_index > 0 {
        let row_sums: [String; 4] =
            std::array::from_fn(|row| asm.fresh_name(&format!("fadd_{row}")));
        for (row, sum) in row_sums.iter().enumerate() {
            body.push(Instruction::with_result(
                sum,
                "OpIAdd",
                ops([
                    "%uint",
                    format!("%uint_{row}").as_str(),
                    id(&field_const).as_str(),
                ]),
            ));
        }
        for (value, sum) in row_values.iter().zip(&row_sums) {
            body.push(Instruction::with_result(
                value,
                "OpIAdd",
                ops(["%uint", data_offset_id.as_str(), id(sum).as_str()]),
            ));
        }
    } else {
        for (row, value) in row_values.iter().enumerate() {
            body.push(Instruction::with_result(
                value,
                "OpIAdd",
                ops([
                    "%uint",
                    data_offset_id.as_str(),
                    format!("%uint_{row}").as_str(),
                ]),
            ));
        }
    }
    inserted.extend(body.iter().filter_map(|inst| inst.result.clone()));
    let body_start = entry_body_start(asm, &entry)?;
    asm.insert_all(body_start, body)?;

    let mut rewritten = [0usize; 4];
    for (row, value) in row_values.iter().enumerate() {
        let Some(target) = field_index.checked_add(row as u32) else {
            continue;
        };
        let positions: Vec<usize> = asm
            .iter()
            .enumerate()
            .filter(|(_, inst)| pattern.matches(inst, target))
            .map(|(pos, _)| pos)
            .collect();
        for &pos in &positions {
            if let Some(operands) = asm.operands_mut(pos) {
                operands[3] = id(value);
            }
        }
        rewritten[row] = positions.len();
    }

    debug!(
        field_index,
        base_offset = offsets.base_offset,
        ?rewritten,
        inserted = inserted.len(),
        "relocated matrix accesses"
    );

    Ok(MatrixPatchReport {
        inserted,
        row_values,
        rewritten,
    })
}

/// Row values are computed at the top of the entry function, so they only dominate accesses
/// inside it.
fn check_accesses_in_entry(
    asm: &Assembly,
    entry: &str,
    field_index: u32,
    pattern: &MatrixAccessPattern,
) -> Result<(), PatchError> {
    let entry_range = asm
        .function_range(entry)
        .ok_or_else(|| PatchError::MissingEntryFunction(entry.to_owned()))?;
    let rows: Vec<u32> = (0..4).filter_map(|row| field_index.checked_add(row)).collect();

    let mut function = None;
    for (position, inst) in asm.iter().enumerate() {
        if inst.is("OpFunction") {
            function = inst.result.as_deref();
        }
        if entry_range.contains(&position) || !rows.iter().any(|&row| pattern.matches(inst, row)) {
            continue;
        }
        return Err(match function {
            Some(function) => PatchError::AccessOutsideEntryFunction {
                function: function.to_owned(),
                position,
            },
            None => PatchError::MalformedInstruction {
                position,
                reason: "OpAccessChain outside any function".into(),
            },
        });
    }
    Ok(())
}

/// Position right after the entry function's first `OpLabel` and its local variable block.
fn entry_body_start(asm: &Assembly, entry: &str) -> Result<usize, PatchError> {
    let range = asm
        .function_range(entry)
        .ok_or_else(|| PatchError::MissingEntryFunction(entry.to_owned()))?;
    let label = asm
        .position_from(range.start, |inst| inst.is("OpLabel"))
        .filter(|pos| range.contains(pos))
        .ok_or(PatchError::MissingInstruction("OpLabel"))?;
    let start = asm
        .position_from(label + 1, |inst| !BLOCK_PREAMBLE.contains(&inst.opcode.as_str()))
        .unwrap_or(range.end);
    Ok(start.min(range.end))
}
