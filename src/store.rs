//! Local artifact layout
//!
//! ```text
//! root/
//!   [deviceName/]          only with multiple_devices
//!     <name>.png           first image of a screenshot
//!     <tile>.png           further tiles, under their own file name
//!     <name>_dump.json     view hierarchy
//!     metadata.json        manifest with local file names
//!   report.json
//! ```
//!
//! Screenshots are keyed by their path below the root without extension, so
//! a single-device store has keys like `login` and a multi-device one keys
//! like `API_30_GP_XXHDPI_1080x2280_x86_64_en-US/login`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};
use crate::device::DeviceDescriptor;
use crate::manifest::{local_file_name, ArtifactManifest, ScreenshotEntry, MANIFEST_FILE};

/// Run report written next to the artifacts
pub const REPORT_FILE: &str = "report.json";

/// Extension of the images the comparator looks at
const IMAGE_EXTENSION: &str = "png";

/// Files in a store that are bookkeeping, not screenshots
const BOOKKEEPING: &[&str] = &[REPORT_FILE];

/// One file to transfer from a device into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullJob {
    /// Screenshot the file belongs to
    pub name: String,
    pub remote: String,
    pub local: PathBuf,
}

/// Directory of pulled (candidate) screenshots for one invocation
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    multiple_devices: bool,
    /// Storage key → device that produced it
    owners: BTreeMap<PathBuf, DeviceDescriptor>,
    /// Namespace directory → localized manifest entries
    metadata: BTreeMap<PathBuf, Vec<ScreenshotEntry>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, multiple_devices: bool) -> Self {
        Self {
            root: root.into(),
            multiple_devices,
            owners: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Remove everything a previous invocation left in the store
    pub fn clean(&self) -> Result<()> {
        if self.root.exists() {
            tracing::debug!(path = %self.root.display(), "Removing stale artifacts");
            std::fs::remove_dir_all(&self.root).map_err(|e| Error::cleaning(&self.root, e))?;
        }
        std::fs::create_dir_all(&self.root).map_err(|e| Error::cleaning(&self.root, e))
    }

    /// Directory a device's screenshots are stored in
    pub fn namespace(&self, device: &DeviceDescriptor) -> PathBuf {
        self.namespace_in(&self.root, device)
    }

    fn namespace_in(&self, dir: &Path, device: &DeviceDescriptor) -> PathBuf {
        if self.multiple_devices {
            dir.join(&device.name)
        } else {
            dir.to_path_buf()
        }
    }

    /// Hidden working directory inside the store, removed on drop
    pub fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.root)?;
        Ok(tempfile::Builder::new()
            .prefix(".scratch-")
            .tempdir_in(&self.root)?)
    }

    /// Claim a screenshot name for a device
    ///
    /// Without per-device namespacing two devices producing the same name
    /// would overwrite each other; that is a `DuplicateScreenshot` error.
    pub fn register(&mut self, device: &DeviceDescriptor, name: &str) -> Result<()> {
        let key = self.namespace(device).join(name);
        match self.owners.get(&key) {
            Some(owner) if owner != device => Err(Error::DuplicateScreenshot {
                name: name.to_string(),
                first: owner.name.clone(),
                second: device.name.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                self.owners.insert(key, device.clone());
                Ok(())
            }
        }
    }

    /// Register every screenshot of a device's manifest and plan its transfers
    ///
    /// Nothing is registered when any name clashes.
    pub fn plan_pull(
        &mut self,
        device: &DeviceDescriptor,
        manifest: &ArtifactManifest,
    ) -> Result<Vec<PullJob>> {
        let namespace = self.namespace(device);
        for entry in manifest.entries() {
            let key = namespace.join(&entry.name);
            if let Some(owner) = self.owners.get(&key) {
                if owner != device {
                    return Err(Error::DuplicateScreenshot {
                        name: entry.name.clone(),
                        first: owner.name.clone(),
                        second: device.name.clone(),
                    });
                }
            }
        }

        let mut jobs = Vec::new();
        let mut localized = Vec::with_capacity(manifest.len());
        for entry in manifest.entries() {
            self.register(device, &entry.name)?;

            let mut local_entry = entry.clone();
            local_entry.files = entry
                .files
                .iter()
                .map(|f| local_name(entry, f))
                .collect();
            local_entry.view_hierarchy = entry.view_hierarchy.as_deref().map(|f| local_name(entry, f));
            localized.push(local_entry);

            for relative in entry.artifacts() {
                jobs.push(PullJob {
                    name: entry.name.clone(),
                    remote: manifest.remote_path(relative),
                    local: namespace.join(local_name(entry, relative)),
                });
            }
        }

        self.metadata.entry(namespace).or_default().extend(localized);
        Ok(jobs)
    }

    /// Write one `metadata.json` per namespace directory
    ///
    /// Entries whose screenshot never arrived are dropped.
    pub fn write_metadata(&self) -> Result<()> {
        for (dir, entries) in &self.metadata {
            let present = entries
                .iter()
                .filter(|e| e.files.iter().any(|f| dir.join(f).is_file()))
                .cloned();
            let manifest = ArtifactManifest::from_entries(dir.display().to_string(), present)?;
            std::fs::create_dir_all(dir)?;
            manifest.write(&dir.join(MANIFEST_FILE))?;
        }
        Ok(())
    }

    /// Copy the stored screenshots into a golden directory
    ///
    /// The golden namespaces of the `replace` devices are emptied first, so
    /// their goldens for screenshots that no longer exist disappear. Every
    /// other golden is only overwritten by a stored file of the same name.
    /// Without per-device namespacing all devices share the golden
    /// directory, so callers should list a device only when every device
    /// delivered. Returns the number of files copied.
    pub fn record_into(&self, record_dir: &Path, replace: &[DeviceDescriptor]) -> Result<usize> {
        let replaced: BTreeSet<PathBuf> = replace
            .iter()
            .map(|device| self.namespace_in(record_dir, device))
            .collect();
        for dir in replaced.iter().filter(|d| d.exists()) {
            tracing::debug!(path = %dir.display(), "Replacing goldens");
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(record_dir)?;

        let mut copied = 0;
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if is_bookkeeping(relative) {
                continue;
            }
            let target = record_dir.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }

        tracing::info!(
            files = copied,
            record_dir = %record_dir.display(),
            "Recorded screenshots"
        );
        Ok(copied)
    }
}

/// Local file name of an on-device artifact
///
/// The first image takes the screenshot's name, the view hierarchy becomes
/// `<name>_dump.<ext>`, further tiles keep their own file name.
pub fn local_name(entry: &ScreenshotEntry, relative: &str) -> String {
    let file = local_file_name(relative);
    let ext = Path::new(file)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    if entry.view_hierarchy.as_deref() == Some(relative) {
        format!("{}_dump{}", entry.name, ext)
    } else if entry.files.first().map(String::as_str) == Some(relative) {
        format!("{}{}", entry.name, ext)
    } else {
        file.to_string()
    }
}

/// Every PNG below `dir`, keyed by relative path without extension
///
/// Keys always use `/`, so they match between platforms and stores.
pub fn screenshot_keys(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut keys = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(keys);
    }

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == IMAGE_EXTENSION)
                .unwrap_or(false)
        })
    {
        let relative = match entry.path().strip_prefix(dir) {
            Ok(r) => r.with_extension(""),
            Err(_) => continue,
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        keys.insert(key, entry.path().to_path_buf());
    }
    Ok(keys)
}

fn is_bookkeeping(relative: &Path) -> bool {
    let name = relative
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    BOOKKEEPING.contains(&name.as_str()) || name.ends_with(".log")
}

/// Paths of the artifacts written for a failed comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureArtifacts {
    pub diff: PathBuf,
    pub expected: PathBuf,
    pub actual: PathBuf,
}

impl FailureArtifacts {
    /// `failure_dir/<key>_diff.png` and its `_expected` / `_actual` siblings
    pub fn for_key(failure_dir: &Path, key: &str) -> Self {
        let base = failure_dir.join(key);
        let with_suffix = |suffix: &str| {
            let mut name = base
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            name.push(suffix);
            base.with_file_name(name)
        };
        Self {
            diff: with_suffix("_diff.png"),
            expected: with_suffix("_expected.png"),
            actual: with_suffix("_actual.png"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn device(name: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(format!("serial-{}", name), name)
    }

    fn manifest(names: &[&str]) -> ArtifactManifest {
        let entries = names.iter().map(|name| ScreenshotEntry {
            name: name.to_string(),
            files: vec![format!("{}.png", name)],
            view_hierarchy: Some(format!("{}_dump.json", name)),
            bounds: None,
            has_accessibility_info: false,
            test_class: None,
            test_name: None,
            group: None,
            error: None,
        });
        ArtifactManifest::from_entries("/sdcard/screenshots/pkg/screenshots-default", entries)
            .unwrap()
    }

    #[test]
    fn test_clean_removes_stale_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        std::fs::create_dir_all(root.join("old")).unwrap();
        std::fs::write(root.join("old/stale.png"), b"x").unwrap();

        let store = ArtifactStore::new(&root, false);
        store.clean().unwrap();
        assert!(root.is_dir());
        assert!(!root.join("old").exists());
    }

    #[test]
    fn test_clean_failure_is_cleaning_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("build");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = ArtifactStore::new(blocker.join("out"), false);
        let err = store.clean().unwrap_err();
        assert!(matches!(err, Error::Cleaning { .. }));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_same_name_on_two_devices_without_namespacing_is_rejected() {
        let mut store = ArtifactStore::new("/tmp/out", false);
        store.plan_pull(&device("pixel4"), &manifest(&["home"])).unwrap();

        let err = store
            .plan_pull(&device("pixel6"), &manifest(&["login", "home"]))
            .unwrap_err();
        assert!(err.is_configuration());
        match err {
            Error::DuplicateScreenshot { name, first, second } => {
                assert_eq!(name, "home");
                assert_eq!(first, "pixel4");
                assert_eq!(second, "pixel6");
            }
            other => panic!("Expected DuplicateScreenshot, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_devices_namespaces_by_device() {
        let mut store = ArtifactStore::new("/tmp/out", true);
        let a = store.plan_pull(&device("pixel4"), &manifest(&["home"])).unwrap();
        let b = store.plan_pull(&device("pixel6"), &manifest(&["home"])).unwrap();

        assert_eq!(a[0].local, PathBuf::from("/tmp/out/pixel4/home.png"));
        assert_eq!(b[0].local, PathBuf::from("/tmp/out/pixel6/home.png"));
        assert_eq!(
            b[1].local,
            PathBuf::from("/tmp/out/pixel6/home_dump.json")
        );
        assert_eq!(
            a[0].remote,
            "/sdcard/screenshots/pkg/screenshots-default/home.png"
        );
    }

    #[test]
    fn test_register_is_idempotent_per_device() {
        let mut store = ArtifactStore::new("/tmp/out", false);
        store.register(&device("pixel4"), "home").unwrap();
        store.register(&device("pixel4"), "home").unwrap();
    }

    #[test]
    fn test_local_name_for_tiles() {
        let entry = ScreenshotEntry {
            name: "fab".into(),
            files: vec!["tiles/fab_0_0.png".into(), "tiles/fab_1_0.png".into()],
            view_hierarchy: Some("fab_dump.json".into()),
            bounds: None,
            has_accessibility_info: false,
            test_class: None,
            test_name: None,
            group: None,
            error: None,
        };
        assert_eq!(local_name(&entry, "tiles/fab_0_0.png"), "fab.png");
        assert_eq!(local_name(&entry, "tiles/fab_1_0.png"), "fab_1_0.png");
        assert_eq!(local_name(&entry, "fab_dump.json"), "fab_dump.json");
    }

    #[test]
    fn test_screenshot_keys_use_relative_paths() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pixel4")).unwrap();
        std::fs::write(dir.path().join("login.png"), b"a").unwrap();
        std::fs::write(dir.path().join("pixel4/home.png"), b"b").unwrap();
        std::fs::write(dir.path().join("login_dump.json"), b"{}").unwrap();
        std::fs::write(dir.path().join(REPORT_FILE), b"{}").unwrap();

        let keys = screenshot_keys(dir.path()).unwrap();
        assert_eq!(
            keys.keys().cloned().collect::<Vec<_>>(),
            vec!["login".to_string(), "pixel4/home".to_string()]
        );
    }

    #[test]
    fn test_record_into_replaces_goldens() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        let goldens = dir.path().join("screenshots");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&goldens).unwrap();
        std::fs::write(root.join("login.png"), b"new").unwrap();
        std::fs::write(root.join(REPORT_FILE), b"{}").unwrap();
        std::fs::write(goldens.join("login.png"), b"old").unwrap();
        std::fs::write(goldens.join("removed.png"), b"old").unwrap();

        let store = ArtifactStore::new(&root, false);
        assert_eq!(store.record_into(&goldens, &[device("pixel4")]).unwrap(), 1);
        assert_eq!(std::fs::read(goldens.join("login.png")).unwrap(), b"new");
        assert!(!goldens.join("removed.png").exists());
        assert!(!goldens.join(REPORT_FILE).exists());
    }

    #[test]
    fn test_record_into_with_filter_keeps_other_goldens() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        let goldens = dir.path().join("screenshots");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&goldens).unwrap();
        std::fs::write(root.join("login.png"), b"new").unwrap();
        std::fs::write(goldens.join("home.png"), b"old").unwrap();

        ArtifactStore::new(&root, false)
            .record_into(&goldens, &[])
            .unwrap();
        assert!(goldens.join("home.png").exists());
        assert!(goldens.join("login.png").exists());
    }

    #[test]
    fn test_record_into_only_replaces_listed_device_namespaces() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        let goldens = dir.path().join("screenshots");
        std::fs::create_dir_all(root.join("pixel4")).unwrap();
        std::fs::create_dir_all(goldens.join("pixel4")).unwrap();
        std::fs::create_dir_all(goldens.join("pixel6")).unwrap();
        std::fs::write(root.join("pixel4/home.png"), b"new").unwrap();
        std::fs::write(goldens.join("pixel4/home.png"), b"old").unwrap();
        std::fs::write(goldens.join("pixel4/removed.png"), b"old").unwrap();
        std::fs::write(goldens.join("pixel6/home.png"), b"old").unwrap();

        let store = ArtifactStore::new(&root, true);
        assert_eq!(store.record_into(&goldens, &[device("pixel4")]).unwrap(), 1);

        assert_eq!(std::fs::read(goldens.join("pixel4/home.png")).unwrap(), b"new");
        assert!(!goldens.join("pixel4/removed.png").exists());
        assert_eq!(std::fs::read(goldens.join("pixel6/home.png")).unwrap(), b"old");
    }

    #[test]
    fn test_scratch_dir_is_hidden_inside_store_and_removed_on_drop() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("out"), false);

        let scratch = store.scratch_dir().unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.starts_with(dir.path().join("out")));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".scratch-"));
        drop(scratch);
        assert!(!path.exists());

        std::fs::write(dir.path().join("file"), b"x").unwrap();
        assert!(ArtifactStore::new(dir.path().join("file/out"), false)
            .scratch_dir()
            .is_err());
    }

    #[test]
    fn test_write_metadata_localizes_and_drops_missing() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        let mut store = ArtifactStore::new(&root, false);
        store.clean().unwrap();
        store.plan_pull(&device("pixel4"), &manifest(&["home", "login"])).unwrap();
        std::fs::write(root.join("home.png"), b"png").unwrap();

        store.write_metadata().unwrap();
        let written = ArtifactManifest::load(&root.join(MANIFEST_FILE), "").unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written.get("home").unwrap().files, vec!["home.png".to_string()]);
    }

    #[test]
    fn test_failure_artifact_paths() {
        let paths = FailureArtifacts::for_key(Path::new("/tmp/failures"), "login");
        assert_eq!(paths.diff, PathBuf::from("/tmp/failures/login_diff.png"));
        assert_eq!(paths.expected, PathBuf::from("/tmp/failures/login_expected.png"));

        let nested = FailureArtifacts::for_key(Path::new("/tmp/failures"), "pixel4/home");
        assert_eq!(nested.actual, PathBuf::from("/tmp/failures/pixel4/home_actual.png"));
    }
}
