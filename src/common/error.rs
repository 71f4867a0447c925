//! Error types for the screenshot test runner
//!
//! Errors are split the same way the run report splits them: configuration
//! and cleaning problems abort the whole invocation, everything raised by a
//! single device is caught at the fan-out boundary and turned into a
//! per-device fault instead.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Reason an APK could not be installed on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallFailureKind {
    /// An already-installed package was signed with a different key
    SignatureMismatch,
    /// Not enough space left on the device
    InsufficientStorage,
    /// Any other `INSTALL_FAILED_*` / `INSTALL_PARSE_FAILED_*` outcome
    Other,
}

/// Main error type for the screenshot test runner
#[derive(Error, Debug)]
pub enum Error {
    // === Pre-flight Errors ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error(
        "Screenshot '{name}' was produced by both '{first}' and '{second}'. \
         Enable 'multiple_devices' to store screenshots per device"
    )]
    DuplicateScreenshot {
        name: String,
        first: String,
        second: String,
    },

    // === Cleaning Errors ===
    #[error("Failed to clean '{}': {}", .path.display(), .source)]
    Cleaning {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // === Device Errors ===
    #[error("Install failed on '{device}' ({kind:?}): {message}")]
    Install {
        device: String,
        kind: InstallFailureKind,
        message: String,
    },

    #[error("Device '{0}' is not reachable")]
    DeviceUnreachable(String),

    #[error("Failed to pull '{remote}' from '{device}': {message}")]
    Pull {
        device: String,
        remote: String,
        message: String,
    },

    #[error("adb command failed: {0}")]
    Adb(String),

    #[error("adb executable not found. Set 'adb' in the config file, ANDROID_SDK/ANDROID_HOME, or add it to PATH")]
    AdbNotFound,

    // === Artifact Errors ===
    #[error("Invalid screenshot manifest: {0}")]
    Manifest(String),

    #[error("Comparison failed: {0}")]
    Comparison(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a cleaning error for the given directory
    pub fn cleaning(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Cleaning {
            path: path.into(),
            source,
        }
    }

    /// Create a pull error
    pub fn pull(device: &str, remote: &str, message: impl ToString) -> Self {
        Self::Pull {
            device: device.to_string(),
            remote: remote.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether this error is a pre-flight configuration problem (exit code 2)
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::ConfigParse(_)
                | Error::DuplicateScreenshot { .. }
                | Error::AdbNotFound
        )
    }

    /// Short machine-readable code, used in JSON output
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) | Error::ConfigParse(_) => "CONFIGURATION_ERROR",
            Error::DuplicateScreenshot { .. } => "DUPLICATE_SCREENSHOT",
            Error::Cleaning { .. } => "CLEANING_ERROR",
            Error::Install { .. } => "INSTALL_ERROR",
            Error::DeviceUnreachable(_) => "DEVICE_UNREACHABLE",
            Error::Pull { .. } => "PULL_ERROR",
            Error::Adb(_) | Error::AdbNotFound => "ADB_ERROR",
            Error::Manifest(_) => "MANIFEST_ERROR",
            Error::Comparison(_) => "COMPARISON_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}
