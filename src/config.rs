// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section and field is optional; anything missing takes its default.
// A missing file is not an error, a malformed one is (and load() falls back).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::engine::EngineConfig as EngineSettings;
use crate::backend::validation::ValidationPolicy;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub compute: ComputeConfig,
    pub debug: DebugConfig,
}

/// Instance / device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub app_name: String,
    pub validation_layers: bool,
    /// Append the driver's description to logged Vulkan result codes
    pub verbose_results: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "vkcompute".to_string(),
            validation_layers: cfg!(debug_assertions),
            verbose_results: cfg!(debug_assertions),
        }
    }
}

/// Round trip settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Compiled SPIR-V compute shader
    pub shader_path: PathBuf,
    pub element_count: u32,
    /// 0 waits forever
    pub fence_timeout_ms: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            shader_path: PathBuf::from("shaders/increment.comp.spv"),
            element_count: 60,
            fence_timeout_ms: 0,
        }
    }
}

impl ComputeConfig {
    /// Fence timeout in nanoseconds
    pub fn fence_timeout(&self) -> u64 {
        match self.fence_timeout_ms {
            0 => crate::backend::WAIT_FOREVER,
            ms => ms.saturating_mul(1_000_000),
        }
    }
}

/// Logging and precondition handling
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    /// "panic", "trust" or "default" (panic in debug builds, trust in release)
    pub preconditions: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            preconditions: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Settings handed to Engine::init
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            app_name: self.engine.app_name.clone(),
            validation_layers: self.engine.validation_layers,
        }
    }

    /// Get precondition policy, build default for unknown values
    pub fn validation_policy(&self) -> ValidationPolicy {
        match self.debug.preconditions.to_lowercase().as_str() {
            "panic" => ValidationPolicy::Panic,
            "trust" => ValidationPolicy::Trust,
            "default" => ValidationPolicy::build_default(),
            other => {
                log::warn!(
                    "Unknown precondition policy '{}', using the build default",
                    other
                );
                ValidationPolicy::build_default()
            }
        }
    }

    /// Get log level as a filter, Info for unknown values
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.compute.element_count, 60);
        assert_eq!(config.compute.shader_path, PathBuf::from("shaders/increment.comp.spv"));
        assert_eq!(config.compute.fence_timeout(), u64::MAX);
        assert_eq!(config.validation_policy(), ValidationPolicy::build_default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [compute]
            element_count = 256
            fence_timeout_ms = 1500

            [debug]
            preconditions = "trust"
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.compute.element_count, 256);
        assert_eq!(config.compute.fence_timeout(), 1_500_000_000);
        assert_eq!(config.engine.app_name, "vkcompute");
        assert_eq!(config.validation_policy(), ValidationPolicy::Trust);
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
    }

    #[test]
    fn unknown_strings_fall_back() {
        let config = Config::parse(
            r#"
            [debug]
            preconditions = "sometimes"
            log_level = "loud"
            "#,
        )
        .unwrap();

        assert_eq!(config.validation_policy(), ValidationPolicy::build_default());
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn engine_settings_carry_over() {
        let config = Config::parse(
            r#"
            [engine]
            app_name = "bench"
            validation_layers = false
            "#,
        )
        .unwrap();

        let settings = config.engine_settings();
        assert_eq!(settings.app_name, "bench");
        assert!(!settings.validation_layers);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[compute]\nelement_count = \"many\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("/definitely/not/here/config.toml").unwrap();
        assert_eq!(config.compute.element_count, 60);
    }
}
