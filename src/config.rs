//! JIT configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest eBPF stack the compiler will reserve.
pub const MAX_STACK_SIZE: usize = 1 << 20;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Compiler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Bytes of eBPF stack below the frame pointer (rounded up to 16)
    pub stack_size: usize,
    /// Reject programs whose last instruction can fall off the end
    pub require_exit: bool,
    /// Print `[JIT]` trace lines to stderr
    pub trace_jit: bool,
    /// Maximum number of instruction slots
    pub max_insns: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            stack_size: 512,
            require_exit: false,
            trace_jit: false,
            max_insns: 1_000_000,
        }
    }
}

impl JitConfig {
    /// Load and validate a config from a TOML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size > MAX_STACK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "stack_size {} exceeds the maximum of {}",
                self.stack_size, MAX_STACK_SIZE
            )));
        }
        if self.max_insns == 0 {
            return Err(ConfigError::Invalid("max_insns must be positive".to_string()));
        }
        Ok(())
    }

    /// Stack reservation in the native frame: `stack_size` rounded up to 16
    /// and capped at [`MAX_STACK_SIZE`].
    pub fn frame_size(&self) -> i32 {
        (self.stack_size.min(MAX_STACK_SIZE).div_ceil(16) * 16) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert_eq!(config.stack_size, 512);
        assert!(!config.require_exit);
        assert!(!config.trace_jit);
        assert_eq!(config.max_insns, 1_000_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = JitConfig::from_toml("stack_size = 100\ntrace_jit = true\n").unwrap();
        assert_eq!(config.stack_size, 100);
        assert!(config.trace_jit);
        assert_eq!(config.max_insns, 1_000_000);
        assert_eq!(config.frame_size(), 112);
    }

    #[test]
    fn test_frame_size() {
        let mut config = JitConfig::default();
        assert_eq!(config.frame_size(), 512);
        config.stack_size = 0;
        assert_eq!(config.frame_size(), 0);
        config.stack_size = 1;
        assert_eq!(config.frame_size(), 16);
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            JitConfig::from_toml("stack_size = 2000000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            JitConfig::from_toml("max_insns = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            JitConfig::from_toml("stack = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            JitConfig::from_toml("stack_size = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jit.toml");
        std::fs::write(&path, "require_exit = true\n").unwrap();
        let config = JitConfig::load(&path).unwrap();
        assert!(config.require_exit);

        assert!(matches!(
            JitConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
