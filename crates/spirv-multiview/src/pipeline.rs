//! Binary-in/binary-out multiview operations.
//!
//! Each operation is a single linear pass:
//!
//! ```text
//! disassemble -> classify -> (flavor-specific edits) -> check layout -> reassemble
//!             -> optimize | validate
//! ```
//!
//! Any failing step aborts the invocation; nothing is retried and no partial output escapes.

use tracing::{debug, trace};

use crate::asm::Assembly;
use crate::capability::add_multiview_capability;
use crate::classify::{classify, ShaderFlavor};
use crate::config::{PatchConfig, ToolchainConfig};
use crate::entry_point::{rewrite_entry_point, InterfacePolicy};
use crate::error::MultiviewError;
use crate::matrix::{patch_matrix_accesses, ViewOffsets};
use crate::toolchain::{SpirvTools, Toolchain};

/// Preferred name of the injected `ViewIndex` input variable.
pub const VIEW_INDEX_NAME: &str = "ViewIndex";

/// Per-call parameters of [`MultiviewPatcher::relocate_multiview_data_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelocateOptions {
    pub field_index: u32,
    pub base_offset: u32,
    /// Run the performance passes instead of validating the result.
    pub optimize: bool,
}

impl RelocateOptions {
    pub fn offsets(&self) -> ViewOffsets {
        ViewOffsets {
            field_index: self.field_index,
            base_offset: self.base_offset,
        }
    }
}

/// Multiview patching entrypoints over a [`Toolchain`].
///
/// Holds no per-invocation state; every operation takes `&self`.
#[derive(Debug, Clone, Default)]
pub struct MultiviewPatcher<T = SpirvTools> {
    toolchain: T,
    config: PatchConfig,
}

impl MultiviewPatcher<SpirvTools> {
    pub fn new(toolchain: ToolchainConfig, config: PatchConfig) -> Self {
        Self::with_toolchain(SpirvTools::new(toolchain), config)
    }
}

impl<T: Toolchain> MultiviewPatcher<T> {
    pub fn with_toolchain(toolchain: T, config: PatchConfig) -> Self {
        Self { toolchain, config }
    }

    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// Runs the toolchain's performance passes over `words`.
    pub fn optimize(&self, words: &[u32]) -> Result<Vec<u32>, MultiviewError> {
        self.toolchain
            .optimize(words)
            .map_err(MultiviewError::Optimization)
    }

    /// Disassembles `words` into an [`Assembly`] and classifies it.
    pub fn disassemble_classified(
        &self,
        words: &[u32],
    ) -> Result<(ShaderFlavor, Assembly), MultiviewError> {
        let text = self
            .toolchain
            .disassemble(words)
            .map_err(MultiviewError::Disassembly)?;
        let asm = Assembly::parse(&text)?;
        let flavor = classify(&asm).map_err(MultiviewError::Classification)?;
        Ok((flavor, asm))
    }

    /// Declares the `MultiView` capability on a translated vertex shader and completes its entry
    /// point interface. The result is always validated.
    pub fn add_multiview_capability(&self, words: &[u32]) -> Result<Vec<u32>, MultiviewError> {
        let (flavor, mut asm) = self.disassemble_classified(words)?;
        if flavor != ShaderFlavor::Vertex {
            return Err(MultiviewError::UnsupportedFlavor {
                flavor,
                operation: "add_multiview_capability",
            });
        }

        add_multiview_capability(&mut asm)?;
        rewrite_entry_point(&mut asm, None, self.interface_policy())?;

        let out = self.reassemble(&asm)?;
        self.finish(out, false)
    }

    /// Moves a vertex shader's matrix reads to the copy belonging to the current view.
    ///
    /// Fixed-function vertex shaders are passed through (the translation layer already emits them
    /// multiview-aware), optionally optimized.
    pub fn relocate_multiview_data_access(
        &self,
        words: &[u32],
        options: RelocateOptions,
    ) -> Result<Vec<u32>, MultiviewError> {
        let (flavor, mut asm) = self.disassemble_classified(words)?;
        match flavor {
            ShaderFlavor::FixedFunctionVertex => {
                debug!("passing fixed-function vertex shader through");
                self.finish(words.to_vec(), options.optimize)
            }
            ShaderFlavor::Vertex => {
                let view_index = asm.fresh_name(VIEW_INDEX_NAME);
                add_multiview_capability(&mut asm)?;
                rewrite_entry_point(&mut asm, Some(&view_index), self.interface_policy())?;
                let report = patch_matrix_accesses(
                    &mut asm,
                    options.offsets(),
                    &self.config.pattern,
                    &view_index,
                )?;
                debug!(
                    rewritten = report.total_rewritten(),
                    "patched vertex shader"
                );

                let out = self.reassemble(&asm)?;
                self.finish(out, options.optimize)
            }
            ShaderFlavor::Other => Err(MultiviewError::UnsupportedFlavor {
                flavor,
                operation: "relocate_multiview_data_access",
            }),
        }
    }

    fn reassemble(&self, asm: &Assembly) -> Result<Vec<u32>, MultiviewError> {
        asm.check_layout()?;
        let text = asm.to_text();
        trace!(%text, "reassembling");
        self.toolchain
            .assemble(&text)
            .map_err(MultiviewError::Reassembly)
    }

    fn finish(&self, words: Vec<u32>, optimize: bool) -> Result<Vec<u32>, MultiviewError> {
        if optimize {
            return self.optimize(&words);
        }
        self.toolchain
            .validate(&words)
            .map_err(MultiviewError::Validation)?;
        Ok(words)
    }

    /// Interface rules of the version the reassembled module will carry, not of the input: the
    /// assembler stamps its own target version on the output. Unknown targets list everything.
    fn interface_policy(&self) -> InterfacePolicy {
        self.toolchain
            .output_version()
            .map(|(major, minor)| InterfacePolicy::for_version(major, minor))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::error::PatchError;
    use crate::test_fixtures::VERTEX_SHADER;
    use crate::toolchain::{ToolchainError, SPIRV_MAGIC};
    use pretty_assertions::assert_eq;

    const VERSION_1_6: u32 = 0x0001_0600;

    /// Stores assembly text verbatim in the words after a SPIR-V header so pipeline behaviour can
    /// be tested without SPIRV-Tools.
    #[derive(Default)]
    struct TextToolchain {
        fail_validation: bool,
        fail_assembly: bool,
        output_version: Option<(u8, u8)>,
        calls: RefCell<Vec<&'static str>>,
        assembled: RefCell<Option<String>>,
    }

    fn encode(text: &str) -> Vec<u32> {
        let bytes = text.as_bytes();
        let mut words = vec![SPIRV_MAGIC, VERSION_1_6, bytes.len() as u32];
        words.extend(bytes.chunks(4).map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        }));
        words
    }

    fn decode(words: &[u32]) -> Result<String, ToolchainError> {
        let [SPIRV_MAGIC, _, len, body @ ..] = words else {
            return Err(ToolchainError::new("disassemble", "bad header"));
        };
        let bytes: Vec<u8> = body.iter().flat_map(|w| w.to_le_bytes()).collect();
        let text = bytes
            .get(..*len as usize)
            .ok_or_else(|| ToolchainError::new("disassemble", "truncated"))?;
        String::from_utf8(text.to_vec()).map_err(|e| ToolchainError::new("disassemble", e.to_string()))
    }

    impl Toolchain for TextToolchain {
        fn disassemble(&self, words: &[u32]) -> Result<String, ToolchainError> {
            self.calls.borrow_mut().push("disassemble");
            decode(words)
        }

        fn assemble(&self, text: &str) -> Result<Vec<u32>, ToolchainError> {
            self.calls.borrow_mut().push("assemble");
            if self.fail_assembly {
                return Err(ToolchainError::new("assemble", "syntax error"));
            }
            *self.assembled.borrow_mut() = Some(text.to_owned());
            Ok(encode(text))
        }

        fn validate(&self, _words: &[u32]) -> Result<(), ToolchainError> {
            self.calls.borrow_mut().push("validate");
            if self.fail_validation {
                return Err(ToolchainError::new("validate", "invalid module"));
            }
            Ok(())
        }

        fn optimize(&self, words: &[u32]) -> Result<Vec<u32>, ToolchainError> {
            self.calls.borrow_mut().push("optimize");
            Ok(words.to_vec())
        }

        fn output_version(&self) -> Option<(u8, u8)> {
            self.output_version
        }
    }

    fn patcher(toolchain: TextToolchain) -> MultiviewPatcher<TextToolchain> {
        MultiviewPatcher::with_toolchain(toolchain, PatchConfig::default())
    }

    fn calls(patcher: &MultiviewPatcher<TextToolchain>) -> Vec<&'static str> {
        patcher.toolchain().calls.borrow().clone()
    }

    fn fixed_function_shader() -> String {
        VERTEX_SHADER.replace("\"VS_test\"", "\"FF_VS_test\"")
    }

    #[test]
    fn relocate_patches_vertex_shader() {
        let patcher = patcher(TextToolchain::default());
        let options = RelocateOptions {
            field_index: 0,
            base_offset: 16,
            optimize: false,
        };
        let out = patcher
            .relocate_multiview_data_access(&encode(VERTEX_SHADER), options)
            .unwrap();

        assert_eq!(calls(&patcher), ["disassemble", "assemble", "validate"]);
        let text = decode(&out).unwrap();
        let asm = Assembly::parse(&text).unwrap();
        assert_eq!(asm.get(0).unwrap().to_string(), "OpCapability MultiView");
        assert_eq!(
            asm.iter().find(|i| i.is("OpEntryPoint")).unwrap().to_string(),
            "OpEntryPoint Vertex %main \"main\" %ViewIndex %c %out_color"
        );
        assert_eq!(
            asm.iter()
                .filter(|i| i.is("OpVariable") && i.operand(1) == Some("Input"))
                .count(),
            1
        );
        for row in 0..4 {
            let value = format!("%i_f0_{row}");
            assert_eq!(
                asm.iter()
                    .filter(|i| i.is("OpAccessChain") && i.operand(3) == Some(value.as_str()))
                    .count(),
                1,
                "{value}"
            );
        }
    }

    #[test]
    fn relocate_optimizes_instead_of_validating() {
        let patcher = patcher(TextToolchain::default());
        let options = RelocateOptions {
            field_index: 2,
            base_offset: 64,
            optimize: true,
        };
        patcher
            .relocate_multiview_data_access(&encode(VERTEX_SHADER), options)
            .unwrap();
        assert_eq!(calls(&patcher), ["disassemble", "assemble", "optimize"]);
    }

    #[test]
    fn fixed_function_passes_through_unchanged() {
        let patcher = patcher(TextToolchain::default());
        let input = encode(&fixed_function_shader());
        let out = patcher
            .relocate_multiview_data_access(&input, RelocateOptions::default())
            .unwrap();
        assert_eq!(out, input);
        assert_eq!(calls(&patcher), ["disassemble", "validate"]);
    }

    #[test]
    fn fixed_function_is_optimized_on_request() {
        let patcher = patcher(TextToolchain::default());
        let options = RelocateOptions {
            optimize: true,
            ..Default::default()
        };
        patcher
            .relocate_multiview_data_access(&encode(&fixed_function_shader()), options)
            .unwrap();
        assert_eq!(calls(&patcher), ["disassemble", "optimize"]);
    }

    #[test]
    fn other_flavors_are_rejected() {
        let patcher = patcher(TextToolchain::default());
        let text = VERTEX_SHADER.replace("\"VS_test\"", "\"PS_test\"");
        let err = patcher
            .relocate_multiview_data_access(&encode(&text), RelocateOptions::default())
            .unwrap_err();
        assert!(
            matches!(
                err,
                MultiviewError::UnsupportedFlavor {
                    flavor: ShaderFlavor::Other,
                    ..
                }
            ),
            "{err:?}"
        );
        assert_eq!(calls(&patcher), ["disassemble"]);
    }

    #[test]
    fn missing_marker_is_a_classification_failure() {
        let patcher = patcher(TextToolchain::default());
        let text = VERTEX_SHADER.replace("%str = OpString \"VS_test\"\n", "");
        let err = patcher
            .relocate_multiview_data_access(&encode(&text), RelocateOptions::default())
            .unwrap_err();
        assert!(
            matches!(
                err,
                MultiviewError::Classification(PatchError::MissingDebugString)
            ),
            "{err:?}"
        );
    }

    #[test]
    fn add_capability_rejects_fixed_function() {
        let patcher = patcher(TextToolchain::default());
        let err = patcher
            .add_multiview_capability(&encode(&fixed_function_shader()))
            .unwrap_err();
        assert!(
            matches!(
                err,
                MultiviewError::UnsupportedFlavor {
                    flavor: ShaderFlavor::FixedFunctionVertex,
                    ..
                }
            ),
            "{err:?}"
        );
        assert!(patcher.toolchain().assembled.borrow().is_none());
    }

    #[test]
    fn add_capability_skips_view_index() {
        let patcher = patcher(TextToolchain::default());
        let out = patcher
            .add_multiview_capability(&encode(VERTEX_SHADER))
            .unwrap();
        assert_eq!(calls(&patcher), ["disassemble", "assemble", "validate"]);

        let asm = Assembly::parse(&decode(&out).unwrap()).unwrap();
        assert_eq!(asm.get(0).unwrap().to_string(), "OpCapability MultiView");
        assert_eq!(
            asm.iter().find(|i| i.is("OpEntryPoint")).unwrap().to_string(),
            "OpEntryPoint Vertex %main \"main\" %c %out_color"
        );
        assert!(!asm.is_defined(VIEW_INDEX_NAME));
    }

    #[test]
    fn validation_failure_produces_no_output() {
        let patcher = patcher(TextToolchain {
            fail_validation: true,
            ..Default::default()
        });
        let err = patcher
            .relocate_multiview_data_access(&encode(VERTEX_SHADER), RelocateOptions::default())
            .unwrap_err();
        assert!(matches!(err, MultiviewError::Validation(_)), "{err:?}");
    }

    #[test]
    fn reassembly_failure_is_reported() {
        let patcher = patcher(TextToolchain {
            fail_assembly: true,
            ..Default::default()
        });
        let err = patcher
            .add_multiview_capability(&encode(VERTEX_SHADER))
            .unwrap_err();
        assert!(matches!(err, MultiviewError::Reassembly(_)), "{err:?}");
        assert_eq!(calls(&patcher), ["disassemble", "assemble"]);
    }

    #[test]
    fn patch_precondition_failure_stops_before_assembly() {
        let patcher = patcher(TextToolchain::default());
        let text = VERTEX_SHADER.replace("%uint_4 = OpConstant %uint 4\n", "");
        let err = patcher
            .relocate_multiview_data_access(&encode(&text), RelocateOptions::default())
            .unwrap_err();
        assert!(
            matches!(
                err,
                MultiviewError::Patch(PatchError::MissingDefinition(ref name)) if name == "uint_4"
            ),
            "{err:?}"
        );
        assert_eq!(calls(&patcher), ["disassemble"]);
    }

    fn entry_point_text(words: &[u32]) -> String {
        let asm = Assembly::parse(&decode(words).unwrap()).unwrap();
        asm.iter()
            .find(|i| i.is("OpEntryPoint"))
            .unwrap()
            .to_string()
    }

    #[test]
    fn interface_follows_output_version_not_input_header() {
        // Legacy input header, modern output: every module-scope variable is listed.
        let mut input = encode(VERTEX_SHADER);
        input[1] = 0x0001_0300;
        let patcher = patcher(TextToolchain {
            output_version: Some((1, 6)),
            ..Default::default()
        });
        let out = patcher
            .relocate_multiview_data_access(&input, RelocateOptions::default())
            .unwrap();
        assert_eq!(
            entry_point_text(&out),
            "OpEntryPoint Vertex %main \"main\" %ViewIndex %c %out_color"
        );

        // Legacy output: only Input/Output variables are legal in the interface.
        let patcher = self::patcher(TextToolchain {
            output_version: Some((1, 3)),
            ..Default::default()
        });
        let out = patcher
            .relocate_multiview_data_access(&encode(VERTEX_SHADER), RelocateOptions::default())
            .unwrap();
        assert_eq!(
            entry_point_text(&out),
            "OpEntryPoint Vertex %main \"main\" %ViewIndex %out_color"
        );
    }

    #[test]
    fn unknown_output_version_lists_every_variable() {
        let mut input = encode(VERTEX_SHADER);
        input[1] = 0x0001_0000;
        let patcher = patcher(TextToolchain::default());
        let out = patcher.add_multiview_capability(&input).unwrap();
        assert_eq!(
            entry_point_text(&out),
            "OpEntryPoint Vertex %main \"main\" %c %out_color"
        );
    }
}
