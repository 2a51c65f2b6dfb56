//! Text-form SPIR-V instruction sequence.
//!
//! SPIRV-Tools disassembles a module into one instruction per line. The patcher edits that form
//! directly: every line is split into an optional result name, an opcode and its operand tokens,
//! and kept in module order next to a result-name index so lookups never rescan strings.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;

use crate::error::PatchError;

/// Comment marker used by the SPIR-V assembly syntax.
const COMMENT_MARKER: char = ';';

/// Formats `name` as an id operand (`%name`).
pub fn id(name: &str) -> String {
    format!("%{name}")
}

/// Strips the `%` sigil from an id operand.
pub fn strip_id(token: &str) -> Option<&str> {
    token.strip_prefix('%')
}

/// Decodes a quoted string literal operand (`"..."`), resolving `\"` and `\\` escapes.
pub fn unquote(token: &str) -> Option<String> {
    let inner = token.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Builds an owned operand list.
pub fn ops<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

/// Logical layout section of a SPIR-V module, in the order the format requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Capability,
    Extension,
    ExtInstImport,
    MemoryModel,
    EntryPoint,
    ExecutionMode,
    /// `OpString`, `OpSource*`.
    DebugStrings,
    /// `OpName`, `OpMemberName`.
    DebugNames,
    DebugModuleProcessed,
    Annotation,
    /// Types, constants, module-scope variables and `OpUndef`.
    Global,
    Function,
}

impl Section {
    /// Section of a module-scope instruction. `OpLine`/`OpNoLine` return `None` since they may
    /// appear between instructions of several sections.
    fn of_module_scope(opcode: &str) -> Option<Section> {
        let section = match opcode {
            "OpCapability" => Section::Capability,
            "OpExtension" => Section::Extension,
            "OpExtInstImport" => Section::ExtInstImport,
            "OpMemoryModel" => Section::MemoryModel,
            "OpEntryPoint" => Section::EntryPoint,
            "OpExecutionMode" | "OpExecutionModeId" => Section::ExecutionMode,
            "OpString" | "OpSourceExtension" | "OpSource" | "OpSourceContinued" => {
                Section::DebugStrings
            }
            "OpName" | "OpMemberName" => Section::DebugNames,
            "OpModuleProcessed" => Section::DebugModuleProcessed,
            "OpDecorate" | "OpMemberDecorate" | "OpDecorationGroup" | "OpGroupDecorate"
            | "OpGroupMemberDecorate" | "OpDecorateId" | "OpDecorateString"
            | "OpMemberDecorateString" => Section::Annotation,
            "OpLine" | "OpNoLine" => return None,
            "OpFunction" => Section::Function,
            _ => Section::Global,
        };
        Some(section)
    }
}

/// One disassembled instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Result name without the `%` sigil.
    pub result: Option<String>,
    pub opcode: String,
    /// Operand tokens as printed by the disassembler. String literals keep their quotes.
    pub operands: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, operands: Vec<String>) -> Self {
        Self {
            result: None,
            opcode: opcode.into(),
            operands,
        }
    }

    pub fn with_result(
        result: impl Into<String>,
        opcode: impl Into<String>,
        operands: Vec<String>,
    ) -> Self {
        Self {
            result: Some(result.into()),
            opcode: opcode.into(),
            operands,
        }
    }

    /// Parses one line of SPIR-V assembly (`%name = OpX a b` or `OpX a b`).
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut tokens = tokenize(line)?.into_iter();
        let first = tokens.next().ok_or("empty instruction")?;

        let (result, opcode) = match strip_id(&first).map(str::to_owned) {
            Some(name) => {
                if name.is_empty() {
                    return Err("empty result name".into());
                }
                match tokens.next().as_deref() {
                    Some("=") => {}
                    _ => return Err(format!("expected `=` after result %{name}")),
                }
                let opcode = tokens
                    .next()
                    .ok_or_else(|| format!("missing opcode after %{name} ="))?;
                (Some(name), opcode)
            }
            None => (None, first),
        };

        if !opcode.starts_with("Op") {
            return Err(format!("`{opcode}` is not an opcode"));
        }

        Ok(Self {
            result,
            opcode,
            operands: tokens.collect(),
        })
    }

    pub fn is(&self, opcode: &str) -> bool {
        self.opcode == opcode
    }

    pub fn operand(&self, index: usize) -> Option<&str> {
        self.operands.get(index).map(String::as_str)
    }

    /// Names of every id operand, without the sigil.
    pub fn referenced_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.operands.iter().filter_map(|op| strip_id(op))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = &self.result {
            write!(f, "%{result} = ")?;
        }
        f.write_str(&self.opcode)?;
        for op in &self.operands {
            write!(f, " {op}")?;
        }
        Ok(())
    }
}

/// Splits an assembly line on whitespace, keeping quoted string literals (with escapes) intact.
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut end = line.len();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        chars.next();
                    }
                    '"' => {
                        end = i + 1;
                        closed = true;
                        break;
                    }
                    _ => {}
                }
            }
            if !closed {
                return Err("unterminated string literal".into());
            }
        } else {
            while let Some(&(i, c)) = chars.peek() {
                if c.is_whitespace() {
                    end = i;
                    break;
                }
                chars.next();
            }
        }
        tokens.push(line[start..end].to_owned());
    }

    Ok(tokens)
}

/// Whether `text` stops in the middle of a quoted string literal.
fn ends_inside_literal(text: &str) -> bool {
    let mut in_literal = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_literal => {
                chars.next();
            }
            '"' => in_literal = !in_literal,
            _ => {}
        }
    }
    in_literal
}

/// Ordered instruction sequence of one module with a result-name index.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    instructions: Vec<Instruction>,
    defs: HashMap<String, usize>,
    /// Names handed out by [`Assembly::fresh_name`] that have no definition yet.
    reserved: HashSet<String>,
}

impl PartialEq for Assembly {
    fn eq(&self, other: &Self) -> bool {
        self.instructions == other.instructions
    }
}

impl Eq for Assembly {}

impl Assembly {
    /// Parses disassembler output. Comment and blank lines are dropped.
    ///
    /// String literals may span lines (the disassembler prints embedded newlines raw, e.g. in
    /// `OpSource` text); such lines are joined back into one instruction.
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        let mut instructions = Vec::new();
        // Start line and accumulated text of an instruction whose literal is still open.
        let mut pending: Option<(usize, String)> = None;

        for (idx, line) in text.lines().enumerate() {
            let (start, joined) = match pending.take() {
                Some((start, mut joined)) => {
                    joined.push('\n');
                    joined.push_str(line);
                    (start, joined)
                }
                None => {
                    let line = line.trim_start();
                    if line.trim_end().is_empty() || line.starts_with(COMMENT_MARKER) {
                        continue;
                    }
                    (idx + 1, line.to_owned())
                }
            };
            if ends_inside_literal(&joined) {
                pending = Some((start, joined));
                continue;
            }
            let inst = Instruction::parse(joined.trim_end()).map_err(|reason| PatchError::Parse {
                line: start,
                reason,
            })?;
            instructions.push(inst);
        }

        if let Some((line, _)) = pending {
            return Err(PatchError::Parse {
                line,
                reason: "unterminated string literal".into(),
            });
        }
        Self::from_instructions(instructions)
    }

    pub fn from_instructions(instructions: Vec<Instruction>) -> Result<Self, PatchError> {
        let mut asm = Self {
            instructions,
            defs: HashMap::new(),
            reserved: HashSet::new(),
        };
        asm.reindex()?;
        Ok(asm)
    }

    /// Renders the module back to assembly text, one instruction per line.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for inst in &self.instructions {
            out.push_str(&inst.to_string());
            out.push('\n');
        }
        out
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&Instruction> {
        self.instructions.get(pos)
    }

    /// Operands of the instruction at `pos`. The result name stays immutable so the index
    /// remains valid.
    pub fn operands_mut(&mut self, pos: usize) -> Option<&mut Vec<String>> {
        self.instructions.get_mut(pos).map(|inst| &mut inst.operands)
    }

    /// Position of the first instruction with `opcode`.
    pub fn position(&self, opcode: &str) -> Option<usize> {
        self.instructions.iter().position(|inst| inst.is(opcode))
    }

    /// Position of the first instruction at or after `start` matching `pred`.
    pub fn position_from(
        &self,
        start: usize,
        mut pred: impl FnMut(&Instruction) -> bool,
    ) -> Option<usize> {
        self.instructions
            .get(start..)?
            .iter()
            .position(|inst| pred(inst))
            .map(|offset| start + offset)
    }

    /// Position of the instruction defining `name`.
    pub fn definition_position(&self, name: &str) -> Option<usize> {
        self.defs.get(name).copied()
    }

    pub fn definition(&self, name: &str) -> Option<&Instruction> {
        self.definition_position(name)
            .and_then(|pos| self.instructions.get(pos))
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    pub fn require_defined(&self, name: &str) -> Result<(), PatchError> {
        if self.is_defined(name) {
            Ok(())
        } else {
            Err(PatchError::MissingDefinition(name.to_owned()))
        }
    }

    /// Returns `preferred` if no instruction defines it and it was not handed out before,
    /// otherwise the first free `preferred_N`. The returned name is reserved.
    pub fn fresh_name(&mut self, preferred: &str) -> String {
        let mut candidate = preferred.to_owned();
        let mut n = 1u32;
        while self.defs.contains_key(&candidate) || self.reserved.contains(&candidate) {
            candidate = format!("{preferred}_{n}");
            n += 1;
        }
        self.reserved.insert(candidate.clone());
        candidate
    }

    /// Range of the function defined by `%name`, from its `OpFunction` through `OpFunctionEnd`.
    pub fn function_range(&self, name: &str) -> Option<Range<usize>> {
        let start = self.definition_position(name)?;
        if !self.instructions[start].is("OpFunction") {
            return None;
        }
        let end = self.position_from(start, |inst| inst.is("OpFunctionEnd"))?;
        Some(start..end + 1)
    }

    /// Position one past the last module-scope instruction.
    pub fn module_scope_end(&self) -> usize {
        self.position("OpFunction").unwrap_or(self.instructions.len())
    }

    pub fn insert(&mut self, pos: usize, inst: Instruction) -> Result<(), PatchError> {
        self.insert_all(pos, vec![inst])
    }

    /// Inserts `insts` in order before the instruction currently at `pos`.
    pub fn insert_all(&mut self, pos: usize, insts: Vec<Instruction>) -> Result<(), PatchError> {
        let mut seen = HashSet::new();
        for inst in &insts {
            if let Some(result) = &inst.result {
                if self.defs.contains_key(result) || !seen.insert(result.as_str()) {
                    return Err(PatchError::DuplicateResult(result.clone()));
                }
            }
        }
        let pos = pos.min(self.instructions.len());
        self.instructions.splice(pos..pos, insts);
        self.reindex()
    }

    /// Replaces the instruction at `pos`.
    pub fn replace(&mut self, pos: usize, inst: Instruction) -> Result<(), PatchError> {
        let old = self
            .instructions
            .get(pos)
            .ok_or_else(|| PatchError::MalformedInstruction {
                position: pos,
                reason: "replacement position out of range".into(),
            })?;
        if let Some(result) = &inst.result {
            if old.result.as_ref() != Some(result) && self.defs.contains_key(result) {
                return Err(PatchError::DuplicateResult(result.clone()));
            }
        }
        self.instructions[pos] = inst;
        self.reindex()
    }

    /// Checks that instructions appear in non-decreasing [`Section`] order and that function
    /// bodies are properly delimited.
    pub fn check_layout(&self) -> Result<(), PatchError> {
        let mut previous = Section::Capability;
        let mut in_function = false;

        for (position, inst) in self.instructions.iter().enumerate() {
            if in_function {
                match inst.opcode.as_str() {
                    "OpFunction" => {
                        return Err(PatchError::MalformedInstruction {
                            position,
                            reason: "OpFunction nested inside another function".into(),
                        });
                    }
                    "OpFunctionEnd" => in_function = false,
                    _ => {}
                }
                continue;
            }

            let Some(section) = Section::of_module_scope(&inst.opcode) else {
                continue;
            };
            if section < previous {
                return Err(PatchError::LayoutViolation {
                    position,
                    opcode: inst.opcode.clone(),
                    section,
                    previous,
                });
            }
            if section == Section::Function {
                in_function = true;
            }
            previous = section;
        }

        if in_function {
            return Err(PatchError::MissingInstruction("OpFunctionEnd"));
        }
        Ok(())
    }

    fn reindex(&mut self) -> Result<(), PatchError> {
        self.defs.clear();
        for (pos, inst) in self.instructions.iter().enumerate() {
            if let Some(result) = &inst.result {
                if self.defs.insert(result.clone(), pos).is_some() {
                    return Err(PatchError::DuplicateResult(result.clone()));
                }
            }
        }
        self.reserved.retain(|name| !self.defs.contains_key(name));
        Ok(())
    }
}
