//! On-device artifact manifest
//!
//! The instrumented test process writes `metadata.json` next to the images it
//! captured. The manifest names every screenshot and lists the files that
//! belong to it, relative to the manifest's own directory on the device.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::common::{Error, Result};

/// File name of the manifest, on the device and in the artifact store
pub const MANIFEST_FILE: &str = "metadata.json";

/// Legacy manifest root used by old test runners that wrote to app data
const LEGACY_ROOT: &str = "/data/data/";

/// View bounds of a captured screenshot, in device pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Capture metadata for one screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotEntry {
    pub name: String,
    /// Image files (tiles included), relative to the manifest directory
    #[serde(default)]
    pub files: Vec<String>,
    /// View hierarchy dump, relative to the manifest directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_hierarchy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub has_accessibility_info: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Set when the capture itself failed on the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScreenshotEntry {
    /// All files to transfer for this screenshot
    pub fn artifacts(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .map(String::as_str)
            .chain(self.view_hierarchy.as_deref())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawManifest {
    /// Run id the test process was started with, when it records one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    test_run_id: Option<String>,
    #[serde(default)]
    screenshots: Vec<ScreenshotEntry>,
}

/// Parsed manifest for one `(device, test run)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactManifest {
    /// On-device directory the relative file names resolve against
    device_dir: String,
    test_run_id: Option<String>,
    entries: BTreeMap<String, ScreenshotEntry>,
}

impl ArtifactManifest {
    /// A manifest with no screenshots
    ///
    /// Used when the test process never wrote one (it crashed before the
    /// first capture, or the tests captured nothing).
    pub fn empty(device_dir: impl Into<String>) -> Self {
        Self {
            device_dir: device_dir.into(),
            test_run_id: None,
            entries: BTreeMap::new(),
        }
    }

    /// Parse manifest JSON
    pub fn parse(json: &str, device_dir: impl Into<String>) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(json).map_err(|e| {
            Error::Manifest(format!(
                "{} (this commonly happens when the test runner did not finish writing it)",
                e
            ))
        })?;
        let mut manifest = Self::from_entries(device_dir, raw.screenshots)?;
        manifest.test_run_id = raw.test_run_id;
        Ok(manifest)
    }

    /// Build a manifest from entries, rejecting duplicate or unsafe names
    pub fn from_entries(
        device_dir: impl Into<String>,
        screenshots: impl IntoIterator<Item = ScreenshotEntry>,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for entry in screenshots {
            if entry.name.is_empty() {
                return Err(Error::Manifest("screenshot with an empty name".to_string()));
            }
            if entry.name.contains(['/', '\\']) || entry.name.contains("..") {
                return Err(Error::Manifest(format!(
                    "screenshot name '{}' is not a valid file name",
                    entry.name
                )));
            }
            for file in entry.artifacts() {
                if file.contains("..") {
                    return Err(Error::Manifest(format!(
                        "screenshot '{}' references '{}' outside the manifest directory",
                        entry.name, file
                    )));
                }
            }
            let name = entry.name.clone();
            if entries.insert(name.clone(), entry).is_some() {
                return Err(Error::Manifest(format!(
                    "screenshot '{}' appears more than once",
                    name
                )));
            }
        }

        Ok(Self {
            device_dir: device_dir.into(),
            test_run_id: None,
            entries,
        })
    }

    /// Load a pulled manifest from disk
    pub fn load(path: &Path, device_dir: impl Into<String>) -> Result<Self> {
        Self::parse(&crate::common::read_to_string(path)?, device_dir)
    }

    /// Write the manifest as JSON
    pub fn write(&self, path: &Path) -> Result<()> {
        let raw = RawManifest {
            test_run_id: self.test_run_id.clone(),
            screenshots: self.entries.values().cloned().collect(),
        };
        std::fs::write(path, serde_json::to_vec_pretty(&raw)?)?;
        Ok(())
    }

    /// A new manifest holding only the screenshots whose name matches
    pub fn filtered(&self, filter: &Regex) -> Self {
        Self {
            device_dir: self.device_dir.clone(),
            test_run_id: self.test_run_id.clone(),
            entries: self
                .entries
                .iter()
                .filter(|(name, _)| filter.is_match(name))
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect(),
        }
    }

    /// Whether the manifest was written by a different test run
    ///
    /// Manifests that carry no run id are assumed current.
    pub fn is_stale(&self, test_run_id: &str) -> bool {
        self.test_run_id
            .as_deref()
            .is_some_and(|id| id != test_run_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ScreenshotEntry> {
        self.entries.get(name)
    }

    /// Screenshots in name order
    pub fn entries(&self) -> impl Iterator<Item = &ScreenshotEntry> {
        self.entries.values()
    }

    /// Absolute on-device path of a file listed in this manifest
    pub fn remote_path(&self, relative: &str) -> String {
        android_path_join(&self.device_dir, relative)
    }
}

/// Join on-device paths with `/` regardless of the host platform
///
/// An absolute right-hand side replaces the left, like `Path::join`.
pub fn android_path_join(base: &str, rest: &str) -> String {
    if rest.starts_with('/') {
        return rest.to_string();
    }
    if base.is_empty() {
        return rest.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, rest)
    } else {
        format!("{}/{}", base, rest)
    }
}

/// Candidate on-device manifest locations, most likely first
pub fn manifest_candidates(external_dir: &str, package: &str) -> Vec<String> {
    let current = android_path_join(
        &android_path_join(&android_path_join(external_dir, "screenshots"), package),
        "screenshots-default",
    );
    let legacy = android_path_join(
        &android_path_join(LEGACY_ROOT, package),
        "app_screenshots-default",
    );

    vec![
        android_path_join(&current, MANIFEST_FILE),
        android_path_join(&legacy, MANIFEST_FILE),
    ]
}

/// Directory part of an on-device path
pub fn remote_parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Local file name for an on-device relative path
pub fn local_file_name(relative: &str) -> &str {
    relative.rsplit('/').next().unwrap_or(relative)
}
