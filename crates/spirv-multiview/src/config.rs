//! Environment-driven configuration.

use spirv_tools::TargetEnv;
use thiserror::Error;

use crate::matrix::MatrixAccessPattern;

pub const TARGET_ENV_VAR: &str = "SPIRV_MULTIVIEW_TARGET_ENV";
pub const MATRIX_PTR_TYPE_VAR: &str = "SPIRV_MULTIVIEW_MATRIX_PTR_TYPE";
pub const MATRIX_BASE_VAR: &str = "SPIRV_MULTIVIEW_MATRIX_BASE";
pub const MATRIX_MEMBER_VAR: &str = "SPIRV_MULTIVIEW_MATRIX_MEMBER";
pub const ROW_PREFIX_VAR: &str = "SPIRV_MULTIVIEW_ROW_PREFIX";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

/// Parses a SPIRV-Tools style environment name (`vulkan1.3`, `spv1.5`, ...).
pub fn parse_target_env(raw: &str) -> Option<TargetEnv> {
    let env = match raw.trim().to_ascii_lowercase().as_str() {
        "vulkan1.0" => TargetEnv::Vulkan_1_0,
        "vulkan1.1" => TargetEnv::Vulkan_1_1,
        "vulkan1.1spv1.4" => TargetEnv::Vulkan_1_1_Spirv_1_4,
        "vulkan1.2" => TargetEnv::Vulkan_1_2,
        "vulkan1.3" => TargetEnv::Vulkan_1_3,
        "spv1.0" => TargetEnv::Universal_1_0,
        "spv1.1" => TargetEnv::Universal_1_1,
        "spv1.2" => TargetEnv::Universal_1_2,
        "spv1.3" => TargetEnv::Universal_1_3,
        "spv1.4" => TargetEnv::Universal_1_4,
        "spv1.5" => TargetEnv::Universal_1_5,
        _ => return None,
    };
    Some(env)
}

/// Settings for the SPIRV-Tools handles.
#[derive(Debug, Clone, Copy)]
pub struct ToolchainConfig {
    /// Environment used for assembly, validation and optimization. Defaults to Vulkan 1.3, the
    /// environment the D3D9 translation layer targets.
    pub target_env: TargetEnv,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            target_env: TargetEnv::Vulkan_1_3,
        }
    }
}

impl ToolchainConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let target_env = match std::env::var(TARGET_ENV_VAR) {
            Ok(raw) => parse_target_env(&raw).ok_or(ConfigError::InvalidEnv(TARGET_ENV_VAR))?,
            Err(_) => Self::default().target_env,
        };
        Ok(Self { target_env })
    }
}

/// Settings for the instruction-level patcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchConfig {
    pub pattern: MatrixAccessPattern,
}

impl PatchConfig {
    /// Reads overrides for the matrix access pattern; unset variables keep the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut pattern = MatrixAccessPattern::default();
        for (var, field) in [
            (MATRIX_PTR_TYPE_VAR, &mut pattern.pointer_type),
            (MATRIX_BASE_VAR, &mut pattern.base),
            (MATRIX_MEMBER_VAR, &mut pattern.member),
            (ROW_PREFIX_VAR, &mut pattern.row_prefix),
        ] {
            if let Ok(raw) = std::env::var(var) {
                *field = parse_name(&raw).ok_or(ConfigError::InvalidEnv(var))?;
            }
        }
        Ok(Self { pattern })
    }
}

/// Accepts an id name with or without its `%` sigil.
fn parse_name(raw: &str) -> Option<String> {
    let name = raw.trim();
    let name = name.strip_prefix('%').unwrap_or(name);
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return None;
    }
    Some(name.to_owned())
}
