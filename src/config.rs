//! Tool configuration
//!
//! Read from the YAML file named by `REACTIVE_CONFIG` (default
//! `reactive.yaml`; a missing file means defaults), then overridden by
//! `REACTIVE_RULES_DIR`, `REACTIVE_BUILD_MODE` and `REACTIVE_OUTPUT`.

use crate::model::{DescriptorError, DescriptorFormat};
use crate::rules::{RuleError, RuleRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_ENV: &str = "REACTIVE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "reactive.yaml";

/// Toolchain build profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Debug,
    Release,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Debug => "debug",
            BuildMode::Release => "release",
        }
    }
}

impl FromStr for BuildMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(BuildMode::Debug),
            "release" => Ok(BuildMode::Release),
            other => Err(ConfigError::Invalid {
                key: "build_mode",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Directory overriding the built-in rule files
    pub rules_dir: Option<PathBuf>,
    pub build_mode: BuildMode,
    /// Format of descriptors written by `deploy`
    pub output_format: DescriptorFormat,
    /// Where the toolchain puts build artifacts
    pub build_dir: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            rules_dir: None,
            build_mode: BuildMode::Debug,
            output_format: DescriptorFormat::Json,
            build_dir: PathBuf::from("build"),
        }
    }
}

impl ToolConfig {
    /// Load from the configured file, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults when `path` does not exist
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `REACTIVE_*` overrides looked up through `var`
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(dir) = var("REACTIVE_RULES_DIR") {
            self.rules_dir = Some(PathBuf::from(dir));
        }
        if let Some(mode) = var("REACTIVE_BUILD_MODE") {
            self.build_mode = mode.parse()?;
        }
        if let Some(format) = var("REACTIVE_OUTPUT") {
            self.output_format = format.parse().map_err(|_: DescriptorError| ConfigError::Invalid {
                key: "output_format",
                value: format.clone(),
            })?;
        }
        Ok(())
    }

    /// Rule registry: built-ins, overridden from `rules_dir` when set
    pub fn registry(&self) -> Result<RuleRegistry, RuleError> {
        match &self.rules_dir {
            Some(dir) => RuleRegistry::from_dir(dir),
            None => RuleRegistry::builtin(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid {key} '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ToolConfig::from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, ToolConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reactive.yaml");
        std::fs::write(&path, "build_mode: release\noutput_format: yaml\n").unwrap();

        let config = ToolConfig::from_file(&path).unwrap();
        assert_eq!(config.build_mode, BuildMode::Release);
        assert_eq!(config.output_format, DescriptorFormat::Yaml);
        assert_eq!(config.build_dir, PathBuf::from("build"));
        assert!(config.rules_dir.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("REACTIVE_RULES_DIR", "/etc/reactive/rules"),
            ("REACTIVE_BUILD_MODE", "Release"),
            ("REACTIVE_OUTPUT", "yml"),
        ]
        .into_iter()
        .collect();

        let mut config = ToolConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.rules_dir, Some(PathBuf::from("/etc/reactive/rules")));
        assert_eq!(config.build_mode, BuildMode::Release);
        assert_eq!(config.output_format, DescriptorFormat::Yaml);
    }

    #[test]
    fn test_bad_override() {
        let mut config = ToolConfig::default();
        let err = config
            .apply_overrides(|k| (k == "REACTIVE_OUTPUT").then(|| "toml".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "output_format", .. }));
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reactive.yaml");
        std::fs::write(&path, "build_mode: [").unwrap();
        assert!(matches!(ToolConfig::from_file(&path), Err(ConfigError::Yaml { .. })));
    }
}
