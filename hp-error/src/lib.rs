//! Unified error handling for Hwprobe
//!
//! This crate provides the single error type returned by the lifecycle
//! operations of the engine: opening the privileged register channel,
//! loading configuration and discovering processors. Per-tick register
//! reads never produce one of these; they degrade to absent sensor values.

use std::io;
use std::path::PathBuf;

/// Result type alias using HwprobeError
pub type Result<T> = std::result::Result<T, HwprobeError>;

/// Unified error type for all Hwprobe lifecycle operations
#[derive(thiserror::Error, Debug)]
pub enum HwprobeError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Privileged Channel Errors
    // ============================================================================
    #[error("Register access driver unavailable at {path}: {source}")]
    DriverUnavailable {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl HwprobeError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unsupported-operation error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create an invalid configuration field error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Map an I/O error on a device node to the matching variant.
    ///
    /// `EACCES`/`EPERM` become `PermissionDenied`, everything else
    /// `DriverUnavailable`.
    pub fn from_device_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{} (need root or CAP_SYS_RAWIO)", path.display()))
            }
            _ => Self::DriverUnavailable { path, source },
        }
    }
}

// Allow converting from String to HwprobeError
impl From<String> for HwprobeError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to HwprobeError
impl From<&str> for HwprobeError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_io_permission_maps_to_permission_denied() {
        let err = HwprobeError::from_device_io(
            "/dev/cpu/0/msr",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, HwprobeError::PermissionDenied(_)));
        assert!(err.to_string().contains("/dev/cpu/0/msr"));
    }

    #[test]
    fn test_device_io_missing_maps_to_driver_unavailable() {
        let err = HwprobeError::from_device_io(
            "/dev/cpu/0/msr",
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(matches!(err, HwprobeError::DriverUnavailable { .. }));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = HwprobeError::invalid_config("calibration.windows", "must be at least 3");
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for calibration.windows: must be at least 3"
        );
    }

    #[test]
    fn test_not_supported_display() {
        let err = HwprobeError::not_supported("cycle counter on aarch64");
        assert!(matches!(err, HwprobeError::NotSupported(_)));
        assert_eq!(err.to_string(), "Operation not supported: cycle counter on aarch64");
    }

    #[test]
    fn test_string_conversions() {
        let a: HwprobeError = "boom".into();
        let b: HwprobeError = String::from("boom").into();
        assert_eq!(a.to_string(), b.to_string());
    }
}
