//! adb-backed device sessions
//!
//! Wraps the `adb` executable: device discovery, device naming, APK install,
//! `am instrument`, and file transfer. Every invocation runs with a timeout
//! and `kill_on_drop`, so a wedged adb server cannot hang the whole run.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use super::{disambiguate, DeviceDescriptor, DeviceSession, ExecutionOutcome, InstrumentationRun};
use crate::common::config::Timeouts;
use crate::common::{paths, Error, InstallFailureKind, Result};

/// Timeout for quick shell queries (getprop, test -e, get-state)
const QUERY_TIMEOUT_SECS: u64 = 15;

/// Fallback when `$EXTERNAL_STORAGE` is unset on the device
const DEFAULT_EXTERNAL_STORAGE: &str = "/sdcard";

/// Handle on the adb executable
#[derive(Debug, Clone)]
pub struct Adb {
    path: PathBuf,
    timeouts: Timeouts,
}

impl Adb {
    pub fn new(path: impl Into<PathBuf>, timeouts: Timeouts) -> Self {
        Self {
            path: path.into(),
            timeouts,
        }
    }

    /// Use the configured adb, or find one in the SDK / PATH
    pub fn locate(configured: Option<&Path>, timeouts: Timeouts) -> Result<Self> {
        let path = match configured {
            Some(path) => path.to_path_buf(),
            None => paths::find_adb().ok_or(Error::AdbNotFound)?,
        };
        Ok(Self::new(path, timeouts))
    }

    /// Serials of all devices in the `device` state
    pub async fn devices(&self) -> Result<Vec<String>> {
        let output = self.run_checked(None, &["devices"], QUERY_TIMEOUT_SECS).await?;
        let mut serials = Vec::new();
        for (serial, state) in parse_devices(&output) {
            if state == "device" {
                serials.push(serial);
            } else {
                tracing::warn!(serial = %serial, state = %state, "Skipping device that is not ready");
            }
        }
        Ok(serials)
    }

    /// Connect to the given serials, or every ready device when empty
    pub async fn connect(&self, serials: &[String]) -> Result<Vec<AdbSession>> {
        let available = self.devices().await?;
        let selected: Vec<String> = if serials.is_empty() {
            available
        } else {
            for serial in serials {
                if !available.contains(serial) {
                    return Err(Error::config(format!(
                        "Device '{}' is not connected (connected: {})",
                        serial,
                        if available.is_empty() {
                            "none".to_string()
                        } else {
                            available.join(", ")
                        }
                    )));
                }
            }
            serials.to_vec()
        };

        let mut descriptors = Vec::with_capacity(selected.len());
        for serial in &selected {
            descriptors.push(self.describe(serial).await);
        }
        disambiguate(&mut descriptors);

        Ok(descriptors
            .into_iter()
            .map(|descriptor| {
                tracing::debug!(serial = %descriptor.serial, name = %descriptor.name, "Connected device");
                AdbSession::new(self.clone(), descriptor)
            })
            .collect())
    }

    /// Compute a stable, configuration-based name for a device
    ///
    /// Falls back to the serial when the device cannot be queried.
    pub async fn describe(&self, serial: &str) -> DeviceDescriptor {
        match self.query_props(serial).await {
            Ok(props) => match props.name() {
                Some(name) => DeviceDescriptor::new(serial, name),
                None => DeviceDescriptor::new(serial, sanitize_name(serial)),
            },
            Err(e) => {
                tracing::warn!(serial = %serial, error = %e, "Could not query device properties");
                DeviceDescriptor::new(serial, sanitize_name(serial))
            }
        }
    }

    async fn query_props(&self, serial: &str) -> Result<DeviceProps> {
        let persist_locale = self.shell(serial, "getprop persist.sys.locale").await?;
        let locale = if persist_locale.trim().is_empty() {
            self.shell(serial, "getprop ro.product.locale").await?
        } else {
            persist_locale
        };

        Ok(DeviceProps {
            api_level: self.shell(serial, "getprop ro.build.version.sdk").await?,
            play_services: !self
                .shell(serial, "pm path com.google.android.gms")
                .await
                .unwrap_or_default()
                .trim()
                .is_empty(),
            density: self.shell(serial, "wm density").await?,
            size: self.shell(serial, "wm size").await?,
            abi: self.shell(serial, "getprop ro.product.cpu.abi").await?,
            locale,
        })
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        self.run_checked(Some(serial), &["shell", command], QUERY_TIMEOUT_SECS)
            .await
    }

    /// Run adb and return its raw output
    async fn run(&self, serial: Option<&str>, args: &[&str], timeout_secs: u64) -> Result<Output> {
        let mut cmd = Command::new(&self.path);
        if let Some(serial) = serial {
            cmd.args(["-s", serial]);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(serial = serial.unwrap_or("-"), "adb {}", args.join(" "));

        timeout(Duration::from_secs(timeout_secs), cmd.output())
            .await
            .map_err(|_| {
                Error::Adb(format!(
                    "'adb {}' timed out after {} seconds",
                    args.join(" "),
                    timeout_secs
                ))
            })?
            .map_err(|e| Error::Adb(format!("Failed to run {}: {}", self.path.display(), e)))
    }

    /// Run adb and return stdout, failing on a non-zero exit
    async fn run_checked(
        &self,
        serial: Option<&str>,
        args: &[&str],
        timeout_secs: u64,
    ) -> Result<String> {
        let output = self.run(serial, args, timeout_secs).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_device_gone(&stderr) {
                return Err(Error::DeviceUnreachable(
                    serial.unwrap_or_default().to_string(),
                ));
            }
            return Err(Error::Adb(format!("'adb {}': {}", args.join(" "), stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// adb session bound to one device
#[derive(Debug, Clone)]
pub struct AdbSession {
    adb: Adb,
    descriptor: DeviceDescriptor,
}

impl AdbSession {
    pub fn new(adb: Adb, descriptor: DeviceDescriptor) -> Self {
        Self { adb, descriptor }
    }

    fn serial(&self) -> &str {
        &self.descriptor.serial
    }
}

#[async_trait]
impl DeviceSession for AdbSession {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn is_reachable(&self) -> bool {
        match self
            .adb
            .run(Some(self.serial()), &["get-state"], QUERY_TIMEOUT_SECS)
            .await
        {
            Ok(output) => {
                output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "device"
            }
            Err(_) => false,
        }
    }

    #[tracing::instrument(skip(self), fields(device = %self.descriptor))]
    async fn install(&self, apk: &Path) -> Result<()> {
        let apk_arg = apk.to_string_lossy();
        let output = self
            .adb
            .run(
                Some(self.serial()),
                &["install", "-r", "-t", &apk_arg],
                self.adb.timeouts.install_secs,
            )
            .await?;

        let text = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        match parse_install_output(&text) {
            Ok(()) if output.status.success() => Ok(()),
            Ok(()) => Err(Error::Install {
                device: self.descriptor.name.clone(),
                kind: InstallFailureKind::Other,
                message: text.trim().to_string(),
            }),
            Err((kind, message)) => Err(Error::Install {
                device: self.descriptor.name.clone(),
                kind,
                message,
            }),
        }
    }

    #[tracing::instrument(skip(self, run), fields(device = %self.descriptor, run_id = %run.test_run_id))]
    async fn execute_instrumented_tests(
        &self,
        run: &InstrumentationRun,
    ) -> Result<ExecutionOutcome> {
        let component = format!("{}/{}", run.package, run.runner);
        let output = self
            .adb
            .run(
                Some(self.serial()),
                &[
                    "shell",
                    "am",
                    "instrument",
                    "-w",
                    "-r",
                    "-e",
                    "testRunId",
                    &run.test_run_id,
                    &component,
                ],
                self.adb.timeouts.instrument_secs,
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_device_gone(&stderr) {
                return Err(Error::DeviceUnreachable(self.descriptor.name.clone()));
            }
            return Err(Error::Adb(format!("am instrument failed: {}", stderr)));
        }

        let outcome = parse_instrumentation(&stdout);
        if let ExecutionOutcome::Crashed { reason } = &outcome {
            tracing::warn!(reason = %reason, "Instrumented test process crashed");
        }
        Ok(outcome)
    }

    async fn external_storage_dir(&self) -> Result<String> {
        let output = self
            .adb
            .shell(self.serial(), "echo $EXTERNAL_STORAGE")
            .await?;
        let dir = output.trim();
        Ok(if dir.is_empty() {
            DEFAULT_EXTERNAL_STORAGE.to_string()
        } else {
            dir.to_string()
        })
    }

    async fn remote_file_exists(&self, remote: &str) -> Result<bool> {
        let output = self
            .adb
            .shell(self.serial(), &format!("test -e {} && echo EXISTS", remote))
            .await?;
        Ok(output.contains("EXISTS"))
    }

    async fn remove_remote(&self, remote: &str) -> Result<()> {
        self.adb
            .shell(self.serial(), &format!("rm -rf {}", remote))
            .await?;
        Ok(())
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        let parent = match local.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        // Transfer next to the destination and rename over it, so a retry
        // replaces the file and an interrupted transfer is never visible.
        let staged = tempfile::Builder::new()
            .prefix(".pull-")
            .tempfile_in(&parent)?;
        let staged_arg = staged.path().to_string_lossy().into_owned();

        let output = self
            .adb
            .run(
                Some(self.serial()),
                &["pull", remote, &staged_arg],
                self.adb.timeouts.pull_secs,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_device_gone(&stderr) {
                return Err(Error::DeviceUnreachable(self.descriptor.name.clone()));
            }
            return Err(Error::pull(&self.descriptor.name, remote, stderr));
        }

        staged.persist(local).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Device properties that make up its name
#[derive(Debug, Default)]
struct DeviceProps {
    api_level: String,
    play_services: bool,
    density: String,
    size: String,
    abi: String,
    locale: String,
}

impl DeviceProps {
    /// `API_<sdk>_<GP|NO_GP>_<density>_<WxH>_<abi>_<locale>`
    fn name(&self) -> Option<String> {
        let api: u32 = self.api_level.trim().parse().ok()?;
        let density: u32 = first_match(r"[0-9]+", &self.density)?.parse().ok()?;
        let size = first_match(r"[0-9]+x[0-9]+", &self.size)?;
        let abi = self.abi.trim();
        let locale = self.locale.trim();
        if abi.is_empty() || locale.is_empty() {
            return None;
        }

        Some(sanitize_name(&format!(
            "API_{}_{}_{}_{}_{}_{}",
            api,
            if self.play_services { "GP" } else { "NO_GP" },
            density_bucket(density),
            size,
            abi,
            locale
        )))
    }
}

fn first_match(pattern: &str, text: &str) -> Option<String> {
    Regex::new(pattern)
        .ok()?
        .find(text)
        .map(|m| m.as_str().to_string())
}

/// Android density bucket for a dpi value
fn density_bucket(dpi: u32) -> &'static str {
    match dpi {
        0..=120 => "LDPI",
        121..=160 => "MDPI",
        161..=240 => "HDPI",
        241..=320 => "XHDPI",
        321..=480 => "XXHDPI",
        _ => "XXXHDPI",
    }
}

/// Make a device name usable as a directory name
pub(crate) fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Parse `adb devices` output into `(serial, state)` pairs
fn parse_devices(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("List of devices") && !l.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some((serial.to_string(), state.to_string()))
        })
        .collect()
}

/// Classify `adb install` output
fn parse_install_output(text: &str) -> std::result::Result<(), (InstallFailureKind, String)> {
    let failure = text
        .lines()
        .map(str::trim)
        .find(|l| l.contains("INSTALL_FAILED_") || l.contains("INSTALL_PARSE_FAILED_"));

    match failure {
        None => Ok(()),
        Some(line) => {
            let kind = if line.contains("INSTALL_FAILED_INSUFFICIENT_STORAGE") {
                InstallFailureKind::InsufficientStorage
            } else if line.contains("INSTALL_FAILED_UPDATE_INCOMPATIBLE")
                || line.contains("INSTALL_FAILED_SHARED_USER_INCOMPATIBLE")
                || line.contains("INSTALL_PARSE_FAILED_NO_CERTIFICATES")
                || line.contains("INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES")
            {
                InstallFailureKind::SignatureMismatch
            } else {
                InstallFailureKind::Other
            };
            Err((kind, line.to_string()))
        }
    }
}

/// Interpret raw (`-r`) `am instrument` output
fn parse_instrumentation(output: &str) -> ExecutionOutcome {
    let mut tests = 0u32;
    let mut failures = 0u32;
    let mut finished = false;
    let mut crash: Option<String> = None;

    for line in output.lines().map(str::trim) {
        if let Some(code) = line.strip_prefix("INSTRUMENTATION_STATUS_CODE:") {
            match code.trim() {
                "1" => tests += 1,
                "-1" | "-2" => failures += 1,
                _ => {}
            }
        } else if let Some(msg) = line.strip_prefix("INSTRUMENTATION_RESULT: shortMsg=") {
            crash = Some(msg.trim().to_string());
        } else if line.starts_with("INSTRUMENTATION_FAILED") || line.starts_with("INSTRUMENTATION_ABORTED") {
            crash = Some(line.to_string());
        } else if line.starts_with("INSTRUMENTATION_CODE:") {
            finished = true;
        }
    }

    match crash {
        Some(reason) => ExecutionOutcome::Crashed { reason },
        None if !finished => ExecutionOutcome::Crashed {
            reason: "test process ended without reporting a result".to_string(),
        },
        None => ExecutionOutcome::Completed { tests, failures },
    }
}

/// Whether adb's error output means the device went away
fn is_device_gone(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("device offline")
        || stderr.contains("no devices")
        || (stderr.contains("device '") && stderr.contains("not found"))
}

/// Read the package name out of an APK with `aapt dump badging`
pub async fn resolve_package(apk: &Path) -> Result<String> {
    let aapt = paths::find_aapt().ok_or_else(|| {
        Error::config("Could not find aapt in ANDROID_SDK build-tools or PATH; pass --package")
    })?;

    let output = Command::new(&aapt)
        .args(["dump", "badging"])
        .arg(apk)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Internal(format!("Failed to run {}: {}", aapt.display(), e)))?;

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find(|l| l.starts_with("package:"))
        .and_then(parse_package_line)
        .ok_or_else(|| {
            Error::config(format!(
                "Could not read the package name of '{}'",
                apk.display()
            ))
        })
}

/// `package: name='com.example.test' versionCode='1'` → `com.example.test`
fn parse_package_line(line: &str) -> Option<String> {
    line.split_whitespace()
        .find_map(|word| word.strip_prefix("name='"))
        .map(|name| name.trim_end_matches('\'').to_string())
}
