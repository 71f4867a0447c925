//! Configuration file handling
//!
//! The file only supplies defaults. Command-line flags win over the file, and
//! the merged values are frozen into one `RunConfiguration` per invocation.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::paths::{config_path, PROJECT_CONFIG_FILE};
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Screenshot storage settings
    #[serde(default)]
    pub screenshots: ScreenshotSettings,

    /// Device / adb settings
    #[serde(default)]
    pub device: DeviceSettings,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Where screenshots are stored and how they are namespaced
#[derive(Debug, Deserialize)]
pub struct ScreenshotSettings {
    /// Directory holding the recorded golden screenshots
    #[serde(default = "default_record_dir")]
    pub record_dir: PathBuf,

    /// Externally supplied reference directory (verify without a device)
    #[serde(default)]
    pub reference_dir: Option<PathBuf>,

    /// Directory receiving diff artifacts for failed verifications
    #[serde(default)]
    pub failure_dir: Option<PathBuf>,

    /// Store screenshots in per-device folders
    #[serde(default)]
    pub multiple_devices: bool,

    /// Fail the run when any device fails to deliver its screenshots
    #[serde(default)]
    pub strict_devices: bool,

    /// Build directory under which per-target output directories live
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            record_dir: default_record_dir(),
            reference_dir: None,
            failure_dir: None,
            multiple_devices: false,
            strict_devices: false,
            build_dir: default_build_dir(),
        }
    }
}

fn default_record_dir() -> PathBuf {
    PathBuf::from("screenshots")
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}

/// Device and instrumentation settings
#[derive(Debug, Deserialize)]
pub struct DeviceSettings {
    /// Path to the adb executable (searched in the SDK and PATH when unset)
    #[serde(default)]
    pub adb: Option<PathBuf>,

    /// Instrumentation runner class
    #[serde(default = "default_runner")]
    pub runner: String,

    /// Restrict the run to these serials (all connected devices when empty)
    #[serde(default)]
    pub serials: Vec<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            adb: None,
            runner: default_runner(),
            serials: Vec::new(),
        }
    }
}

fn default_runner() -> String {
    "androidx.test.runner.AndroidJUnitRunner".to_string()
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Timeout for installing the test APK
    #[serde(default = "default_install")]
    pub install_secs: u64,

    /// Timeout for the whole instrumented test process
    #[serde(default = "default_instrument")]
    pub instrument_secs: u64,

    /// Timeout for pulling a single file
    #[serde(default = "default_pull")]
    pub pull_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            install_secs: default_install(),
            instrument_secs: default_instrument(),
            pull_secs: default_pull(),
        }
    }
}

fn default_install() -> u64 {
    300
}
fn default_instrument() -> u64 {
    3600
}
fn default_pull() -> u64 {
    120
}

impl Config {
    /// Load configuration
    ///
    /// Looks for `screenshots.toml` in the working directory first, then the
    /// per-user config file. Returns the defaults when neither exists.
    pub fn load() -> Result<Self> {
        let project = PathBuf::from(PROJECT_CONFIG_FILE);
        if project.exists() {
            return Self::load_from(&project);
        }

        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.screenshots.record_dir, PathBuf::from("screenshots"));
        assert!(config.screenshots.reference_dir.is_none());
        assert!(!config.screenshots.multiple_devices);
        assert_eq!(config.device.runner, "androidx.test.runner.AndroidJUnitRunner");
        assert_eq!(config.timeouts.pull_secs, 120);
    }

    #[test]
    fn test_partial_config() {
        let config = Config::parse(
            r#"
[screenshots]
record_dir = "goldens"
failure_dir = "build/failures"
multiple_devices = true

[device]
serials = ["emulator-5554"]

[timeouts]
install_secs = 60
"#,
        )
        .unwrap();

        assert_eq!(config.screenshots.record_dir, PathBuf::from("goldens"));
        assert_eq!(
            config.screenshots.failure_dir,
            Some(PathBuf::from("build/failures"))
        );
        assert!(config.screenshots.multiple_devices);
        assert_eq!(config.device.serials, vec!["emulator-5554".to_string()]);
        assert_eq!(config.timeouts.install_secs, 60);
        assert_eq!(config.timeouts.instrument_secs, 3600);
    }

    #[test]
    fn test_invalid_config_is_parse_error() {
        let err = Config::parse("[screenshots]\nmultiple_devices = \"yes\"").unwrap_err();
        assert!(matches!(err, crate::common::Error::ConfigParse(_)));
    }
}
