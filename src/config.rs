//! Compiler configuration, loaded from TOML.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration.

use crate::asm::AbstractionPreference;
use crate::code::{BL_REACH, MAX_RUNTIME_REGIONS};
use crate::ir::optimize::OptimizerOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("failed to serialise configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeCacheConfig {
    /// Bytes per runtime region.
    pub region_size: usize,
    /// Runtime region slots, at most 64.
    pub region_count: usize,
    pub boot_region_size: usize,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self { region_size: 1 << 20, region_count: 64, boot_region_size: 4 << 20 }
    }
}

impl CodeCacheConfig {
    /// Bytes reserved for the whole code window.
    pub fn window_size(&self) -> Option<usize> {
        self.region_count
            .checked_mul(self.region_size)?
            .checked_add(self.boot_region_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkingStackConfig {
    /// Number of cells.
    pub capacity: usize,
    pub drain_threshold_percent: u8,
}

impl Default for MarkingStackConfig {
    fn default() -> Self {
        Self { capacity: 1024, drain_threshold_percent: 75 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSection {
    pub inline: bool,
    /// Largest callee, in bytecode instructions, that is inlined.
    pub inline_max_nodes: usize,
    pub fold_constants: bool,
    /// Defer call linking to a single pass after every method is compiled.
    pub building_boot_image: bool,
    /// Parallel compilation threads; 0 uses the available parallelism.
    pub workers: usize,
}

impl Default for CompilerSection {
    fn default() -> Self {
        let optimizer = OptimizerOptions::default();
        Self {
            inline: optimizer.inline,
            inline_max_nodes: optimizer.inline_max_nodes,
            fold_constants: optimizer.fold_constants,
            building_boot_image: false,
            workers: 0,
        }
    }
}

impl CompilerSection {
    pub fn optimizer_options(&self) -> OptimizerOptions {
        OptimizerOptions {
            inline: self.inline,
            inline_max_nodes: self.inline_max_nodes,
            fold_constants: self.fold_constants,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisassemblerConfig {
    /// Report words no template accepts as `.bytes` instead of failing.
    pub inline_invalid_as_bytes: bool,
    pub preference: AbstractionPreference,
}

impl Default for DisassemblerConfig {
    fn default() -> Self {
        Self { inline_invalid_as_bytes: true, preference: AbstractionPreference::Synthetic }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub code_cache: CodeCacheConfig,
    pub marking_stack: MarkingStackConfig,
    pub compiler: CompilerSection,
    pub disassembler: DisassemblerConfig,
}

impl CompilerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: Self = toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cache = &self.code_cache;
        if cache.region_size == 0 || cache.boot_region_size == 0 {
            return Err(ConfigError::Invalid("code cache region sizes must be non-zero".into()));
        }
        if cache.region_count > MAX_RUNTIME_REGIONS {
            return Err(ConfigError::Invalid(format!(
                "region_count {} exceeds {MAX_RUNTIME_REGIONS}",
                cache.region_count
            )));
        }
        match cache.window_size() {
            Some(size) if size <= BL_REACH => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "code window exceeds the {} MiB call reach",
                    BL_REACH >> 20
                )));
            }
        }
        if self.marking_stack.capacity < 2 {
            return Err(ConfigError::Invalid("marking stack capacity must be at least 2".into()));
        }
        if self.marking_stack.drain_threshold_percent == 0 || self.marking_stack.drain_threshold_percent > 100 {
            return Err(ConfigError::Invalid("drain_threshold_percent must be within 1..=100".into()));
        }
        if self.compiler.inline_max_nodes == 0 && self.compiler.inline {
            return Err(ConfigError::Invalid("inline_max_nodes must be non-zero when inlining".into()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config: CompilerConfig = toml::from_str("").unwrap();
        assert_eq!(config, CompilerConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: CompilerConfig = toml::from_str(
            "[code_cache]\nregion_count = 8\n\n[disassembler]\npreference = \"raw\"\n",
        )
        .unwrap();
        assert_eq!(config.code_cache.region_count, 8);
        assert_eq!(config.code_cache.region_size, 1 << 20);
        assert_eq!(config.disassembler.preference, AbstractionPreference::Raw);
        assert!(config.disassembler.inline_invalid_as_bytes);
    }

    #[test]
    fn test_validate_rejects_oversized_window() {
        let mut config = CompilerConfig::default();
        config.code_cache.region_size = 4 << 20;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.code_cache = CodeCacheConfig { region_count: 65, ..CodeCacheConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = CompilerConfig::default().to_toml().unwrap();
        let back: CompilerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, CompilerConfig::default());
    }
}
