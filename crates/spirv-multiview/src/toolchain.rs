//! SPIR-V toolchain façade.
//!
//! Disassembly, assembly, validation and optimization are delegated to SPIRV-Tools. The
//! [`Toolchain`] trait is the seam the pipeline is written against; [`SpirvTools`] is the
//! production implementation.

use std::fmt;
use std::sync::Arc;

use spirv_tools::assembler::{self, Assembler};
use spirv_tools::opt::{self, Optimizer};
use spirv_tools::val::{self, Validator};
use spirv_tools::TargetEnv;
use thiserror::Error;
use tracing::warn;

use crate::config::ToolchainConfig;

/// SPIR-V binary magic number (first word of every module).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// `(major, minor)` version from a SPIR-V module header, if `words` starts with one.
pub fn spirv_version(words: &[u32]) -> Option<(u8, u8)> {
    match words {
        [SPIRV_MAGIC, version, ..] => Some(((version >> 16) as u8, (version >> 8) as u8)),
        _ => None,
    }
}

/// One message reported by the toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SPIRV-Tools: {}:{}: {}", self.line, self.column, self.message)
    }
}

/// Receiver for toolchain diagnostics. Purely advisory: it never influences results.
pub type DiagnosticSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{operation}: {message}")]
pub struct ToolchainError {
    pub operation: &'static str,
    pub message: String,
}

impl ToolchainError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

pub trait Toolchain {
    /// Binary to assembly text, using friendly names and no header comments.
    fn disassemble(&self, words: &[u32]) -> Result<String, ToolchainError>;
    fn assemble(&self, text: &str) -> Result<Vec<u32>, ToolchainError>;
    fn validate(&self, words: &[u32]) -> Result<(), ToolchainError>;
    /// Runs the standard performance passes.
    fn optimize(&self, words: &[u32]) -> Result<Vec<u32>, ToolchainError>;

    /// SPIR-V version stamped on modules produced by [`Toolchain::assemble`], if known.
    fn output_version(&self) -> Option<(u8, u8)> {
        None
    }
}

/// SPIR-V version the assembler emits for `env`.
pub fn target_spirv_version(env: TargetEnv) -> Option<(u8, u8)> {
    let version = match env {
        TargetEnv::Universal_1_0 | TargetEnv::Vulkan_1_0 => (1, 0),
        TargetEnv::Universal_1_1 => (1, 1),
        TargetEnv::Universal_1_2 => (1, 2),
        TargetEnv::Universal_1_3 | TargetEnv::Vulkan_1_1 => (1, 3),
        TargetEnv::Universal_1_4 | TargetEnv::Vulkan_1_1_Spirv_1_4 => (1, 4),
        TargetEnv::Universal_1_5 | TargetEnv::Vulkan_1_2 => (1, 5),
        TargetEnv::Universal_1_6 | TargetEnv::Vulkan_1_3 => (1, 6),
        _ => return None,
    };
    Some(version)
}

/// [`Toolchain`] backed by SPIRV-Tools.
///
/// Tool handles are created per call, so one instance can be shared between threads.
#[derive(Clone)]
pub struct SpirvTools {
    target_env: TargetEnv,
    sink: Option<DiagnosticSink>,
}

impl fmt::Debug for SpirvTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpirvTools")
            .field("target_env", &self.target_env)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for SpirvTools {
    fn default() -> Self {
        Self::new(ToolchainConfig::default())
    }
}

impl SpirvTools {
    pub fn new(config: ToolchainConfig) -> Self {
        Self {
            target_env: config.target_env,
            sink: None,
        }
    }

    /// Forwards every diagnostic to `sink` in addition to the `tracing` log.
    pub fn with_sink(mut self, sink: DiagnosticSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn target_env(&self) -> TargetEnv {
        self.target_env
    }

    fn report(&self, diagnostic: &Diagnostic) {
        warn!(
            target: "spirv_multiview::toolchain",
            line = diagnostic.line,
            column = diagnostic.column,
            "{}",
            diagnostic.message
        );
        if let Some(sink) = &self.sink {
            sink(diagnostic);
        }
    }

    fn failure(&self, operation: &'static str, err: spirv_tools::error::Error) -> ToolchainError {
        if let Some(diag) = &err.diagnostic {
            self.report(&Diagnostic {
                line: diag.line,
                column: diag.column,
                message: diag.message.clone(),
            });
        }
        ToolchainError::new(operation, err.to_string())
    }
}

impl Toolchain for SpirvTools {
    fn disassemble(&self, words: &[u32]) -> Result<String, ToolchainError> {
        let assembler = assembler::create(Some(self.target_env));
        let options = assembler::DisassembleOptions {
            use_friendly_names: true,
            no_header: true,
            ..Default::default()
        };
        match assembler.disassemble(words, options) {
            Ok(Some(text)) => Ok(text),
            Ok(None) => Err(ToolchainError::new(
                "disassemble",
                "disassembler returned no text",
            )),
            Err(err) => Err(self.failure("disassemble", err)),
        }
    }

    fn assemble(&self, text: &str) -> Result<Vec<u32>, ToolchainError> {
        let assembler = assembler::create(Some(self.target_env));
        assembler
            .assemble(text, assembler::AssemblerOptions::default())
            .map(|binary| binary.as_words().to_vec())
            .map_err(|err| self.failure("assemble", err))
    }

    fn validate(&self, words: &[u32]) -> Result<(), ToolchainError> {
        let validator = val::create(Some(self.target_env));
        validator
            .validate(words, None)
            .map_err(|err| self.failure("validate", err))
    }

    fn optimize(&self, words: &[u32]) -> Result<Vec<u32>, ToolchainError> {
        let mut optimizer = opt::create(Some(self.target_env));
        optimizer.register_performance_passes();
        optimizer
            .optimize(
                words,
                &mut |msg: spirv_tools::error::Message| {
                    self.report(&Diagnostic {
                        line: msg.line,
                        column: msg.column,
                        message: msg.message,
                    });
                },
                None,
            )
            .map(|binary| binary.as_words().to_vec())
            // The message callback above already reported the diagnostic.
            .map_err(|err| ToolchainError::new("optimize", err.to_string()))
    }

    fn output_version(&self) -> Option<(u8, u8)> {
        target_spirv_version(self.target_env)
    }
}
