//! Configuration, SDK tool, and artifact directory paths

use std::path::{Path, PathBuf};

/// Name used for the per-user configuration directory
const APP_NAME: &str = "screenshot-tests";

/// Project-local configuration file, looked up in the working directory
pub const PROJECT_CONFIG_FILE: &str = "screenshots.toml";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/screenshot-tests/`
/// - macOS: `~/Library/Application Support/screenshot-tests/`
/// - Windows: `%APPDATA%\screenshot-tests\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the user configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Android SDK root from `ANDROID_SDK` or `ANDROID_HOME`
pub fn android_sdk() -> Option<PathBuf> {
    std::env::var_os("ANDROID_SDK")
        .or_else(|| std::env::var_os("ANDROID_HOME"))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Locate the adb executable
///
/// Order: the SDK's `platform-tools`, then `PATH`.
pub fn find_adb() -> Option<PathBuf> {
    if let Some(sdk) = android_sdk() {
        for name in ["adb", "adb.exe"] {
            let candidate = sdk.join("platform-tools").join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    which::which("adb").ok()
}

/// Locate the aapt executable, preferring the newest build-tools version
pub fn find_aapt() -> Option<PathBuf> {
    if let Some(sdk) = android_sdk() {
        let build_tools = sdk.join("build-tools");
        if let Ok(entries) = std::fs::read_dir(&build_tools) {
            let mut versions: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            versions.sort_by(|a, b| b.cmp(a));

            for version in versions {
                for name in ["aapt", "aapt.exe"] {
                    let candidate = version.join(name);
                    if candidate.is_file() {
                        return Some(candidate);
                    }
                }
            }
        }
    }
    which::which("aapt").ok()
}

/// Default landing directory for one target's pulled screenshots
///
/// `build/screenshotsDebugAndroidTest` for target `debugAndroidTest`.
pub fn target_output_dir(build_dir: &Path, target: &str) -> PathBuf {
    build_dir.join(format!("screenshots{}", capitalize(target)))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
