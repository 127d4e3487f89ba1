//! Kernel configuration
//!
//! Limits are plain data, loadable from JSON. Defaults suit a small
//! teaching system.

use crate::kernel::proctable::PID_MAX;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("open_max must be greater than 3 (got {0})")]
    OpenMaxTooSmall(usize),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("max_processes {0} exceeds the pid space")]
    TooManyProcesses(usize),
    #[error("user_pointer_width must be 4 or 8 (got {0})")]
    PointerWidth(usize),
    #[error("invalid config: {0}")]
    Parse(String),
}

/// Kernel limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Descriptors per process, including the three console slots
    pub open_max: usize,
    /// System open-file table size as a multiple of `open_max`
    pub system_open_factor: usize,
    /// Live processes (including unreaped zombies)
    pub max_processes: usize,
    /// Longest path accepted from user space, terminator included
    pub path_max: usize,
    /// Total bytes of argv strings accepted by execv
    pub arg_max: usize,
    /// Size of a user pointer in bytes
    pub user_pointer_width: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            open_max: 128,
            system_open_factor: 10,
            max_processes: 256,
            path_max: 1024,
            arg_max: 65536,
            user_pointer_width: 4,
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.open_max <= 3 {
            return Err(ConfigError::OpenMaxTooSmall(self.open_max));
        }
        if self.system_open_factor == 0 {
            return Err(ConfigError::Zero("system_open_factor"));
        }
        if self.max_processes == 0 {
            return Err(ConfigError::Zero("max_processes"));
        }
        if self.max_processes > (PID_MAX - 1) as usize {
            return Err(ConfigError::TooManyProcesses(self.max_processes));
        }
        if self.path_max == 0 {
            return Err(ConfigError::Zero("path_max"));
        }
        if self.arg_max == 0 {
            return Err(ConfigError::Zero("arg_max"));
        }
        if self.user_pointer_width != 4 && self.user_pointer_width != 8 {
            return Err(ConfigError::PointerWidth(self.user_pointer_width));
        }
        Ok(())
    }

    /// Size of the system-wide open-file table
    pub fn system_open_max(&self) -> usize {
        self.open_max.saturating_mul(self.system_open_factor)
    }

    pub fn with_open_max(mut self, n: usize) -> Self {
        self.open_max = n;
        self
    }

    pub fn with_system_open_factor(mut self, factor: usize) -> Self {
        self.system_open_factor = factor;
        self
    }

    pub fn with_max_processes(mut self, n: usize) -> Self {
        self.max_processes = n;
        self
    }

    pub fn with_path_max(mut self, n: usize) -> Self {
        self.path_max = n;
        self
    }

    pub fn with_arg_max(mut self, n: usize) -> Self {
        self.arg_max = n;
        self
    }

    pub fn with_pointer_width(mut self, width: usize) -> Self {
        self.user_pointer_width = width;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = KernelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.system_open_max(), 1280);
    }

    #[test]
    fn test_builder() {
        let config = KernelConfig::new()
            .with_open_max(8)
            .with_system_open_factor(2)
            .with_pointer_width(8);
        assert_eq!(config.system_open_max(), 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        assert_eq!(
            KernelConfig::new().with_open_max(3).validate(),
            Err(ConfigError::OpenMaxTooSmall(3))
        );
        assert_eq!(
            KernelConfig::new().with_system_open_factor(0).validate(),
            Err(ConfigError::Zero("system_open_factor"))
        );
        assert_eq!(
            KernelConfig::new().with_pointer_width(2).validate(),
            Err(ConfigError::PointerWidth(2))
        );
    }

    #[test]
    fn test_max_processes_fits_pid_space() {
        let most = (PID_MAX - 1) as usize;
        assert!(KernelConfig::new().with_max_processes(most).validate().is_ok());
        assert_eq!(
            KernelConfig::new().with_max_processes(40_000).validate(),
            Err(ConfigError::TooManyProcesses(40_000))
        );
        assert!(matches!(
            KernelConfig::from_json(r#"{ "max_processes": 32767 }"#),
            Err(ConfigError::TooManyProcesses(32767))
        ));
    }

    #[test]
    fn test_from_json_partial() {
        let config = KernelConfig::from_json(r#"{ "open_max": 16 }"#).unwrap();
        assert_eq!(config.open_max, 16);
        assert_eq!(config.max_processes, 256);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            KernelConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            KernelConfig::from_json(r#"{ "user_pointer_width": 5 }"#),
            Err(ConfigError::PointerWidth(5))
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = KernelConfig::new().with_open_max(32);
        let json = config.to_json().unwrap();
        assert_eq!(KernelConfig::from_json(&json).unwrap(), config);
    }
}
