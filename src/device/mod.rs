//! Connected test devices
//!
//! A `DeviceSession` is the only way the orchestrator talks to a device. The
//! adb-backed implementation lives in `adb`; tests substitute in-memory
//! sessions. Faults raised by a session are turned into `DeviceFault`s by the
//! fan-out and never unwind further.

pub mod adb;
pub mod fanout;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::common::{Error, InstallFailureKind, Result};
use crate::manifest::manifest_candidates;

pub use adb::{Adb, AdbSession};
pub use fanout::{run_across_devices, FanOutResult, FanOutStatus, SharedSession};

/// One connected test target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceDescriptor {
    /// Transport id (adb serial)
    pub serial: String,
    /// Stable name used to namespace stored screenshots
    pub name: String,
}

impl DeviceDescriptor {
    pub fn new(serial: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.serial == self.name {
            write!(f, "{}", self.serial)
        } else {
            write!(f, "{} ({})", self.name, self.serial)
        }
    }
}

/// Give devices that share a computed name a serial suffix
///
/// Two instances of one emulator image report identical properties, so
/// their names alone cannot namespace their screenshots.
pub fn disambiguate(descriptors: &mut [DeviceDescriptor]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for descriptor in descriptors.iter() {
        *counts.entry(descriptor.name.clone()).or_default() += 1;
    }

    for descriptor in descriptors.iter_mut() {
        if counts.get(&descriptor.name).copied().unwrap_or(0) > 1 {
            descriptor.name = format!(
                "{}_{}",
                descriptor.name,
                adb::sanitize_name(&descriptor.serial)
            );
        }
    }
}

/// Sessions with colliding names wrapped under unique ones
pub fn with_unique_names(sessions: Vec<SharedSession>) -> Vec<SharedSession> {
    let mut descriptors: Vec<DeviceDescriptor> =
        sessions.iter().map(|s| s.descriptor().clone()).collect();
    disambiguate(&mut descriptors);

    sessions
        .into_iter()
        .zip(descriptors)
        .map(|(session, descriptor)| {
            if session.descriptor() == &descriptor {
                session
            } else {
                tracing::debug!(from = %session.descriptor(), to = %descriptor.name, "Renamed device");
                Arc::new(Renamed {
                    inner: session,
                    descriptor,
                }) as SharedSession
            }
        })
        .collect()
}

/// Parameters of one instrumented test execution
#[derive(Debug, Clone)]
pub struct InstrumentationRun {
    pub package: String,
    pub runner: String,
    pub test_run_id: String,
}

/// How the on-device test process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The process exited normally; individual tests may still have failed
    Completed { tests: u32, failures: u32 },
    /// The process died; screenshots captured before the crash may exist
    Crashed { reason: String },
}

/// Capabilities the orchestrator needs from a device
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Identity of the device behind this session
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Whether the device still answers
    async fn is_reachable(&self) -> bool;

    /// Install (or reinstall) the test APK
    async fn install(&self, apk: &Path) -> Result<()>;

    /// Run the instrumented tests, blocking until the test process exits
    async fn execute_instrumented_tests(&self, run: &InstrumentationRun)
        -> Result<ExecutionOutcome>;

    /// Root of the device's external storage (e.g. `/sdcard`)
    async fn external_storage_dir(&self) -> Result<String>;

    /// Whether a path exists on the device
    async fn remote_file_exists(&self, remote: &str) -> Result<bool>;

    /// Remove a file or directory tree on the device
    async fn remove_remote(&self, remote: &str) -> Result<()>;

    /// Copy a device file to a local path
    ///
    /// Must replace an existing local file so retries are safe.
    async fn pull(&self, remote: &str, local: &Path) -> Result<()>;

    /// Where the test process for `package` left its manifest
    ///
    /// `None` when no known location holds one.
    async fn manifest_location(&self, package: &str) -> Result<Option<String>> {
        let external = self.external_storage_dir().await?;
        for candidate in manifest_candidates(&external, package) {
            if self.remote_file_exists(&candidate).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

/// A session presented under a different name
struct Renamed {
    inner: SharedSession,
    descriptor: DeviceDescriptor,
}

#[async_trait]
impl DeviceSession for Renamed {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn is_reachable(&self) -> bool {
        self.inner.is_reachable().await
    }

    async fn install(&self, apk: &Path) -> Result<()> {
        self.inner.install(apk).await
    }

    async fn execute_instrumented_tests(
        &self,
        run: &InstrumentationRun,
    ) -> Result<ExecutionOutcome> {
        self.inner.execute_instrumented_tests(run).await
    }

    async fn external_storage_dir(&self) -> Result<String> {
        self.inner.external_storage_dir().await
    }

    async fn remote_file_exists(&self, remote: &str) -> Result<bool> {
        self.inner.remote_file_exists(remote).await
    }

    async fn remove_remote(&self, remote: &str) -> Result<()> {
        self.inner.remove_remote(remote).await
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        self.inner.pull(remote, local).await
    }

    async fn manifest_location(&self, package: &str) -> Result<Option<String>> {
        self.inner.manifest_location(package).await
    }
}

/// A per-device failure, caught at the fan-out boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceFault {
    /// The APK could not be installed
    Install {
        reason: InstallFailureKind,
        message: String,
    },
    /// The device stopped answering
    Unreachable,
    /// Any other failure talking to the device
    Communication { message: String },
    /// The per-device task panicked
    Panicked { message: String },
}

impl DeviceFault {
    /// Whether the device dropped off
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DeviceFault::Unreachable)
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFault::Install { reason, message } => {
                write!(f, "install failed ({:?}): {}", reason, message)
            }
            DeviceFault::Unreachable => write!(f, "device unreachable"),
            DeviceFault::Communication { message } => write!(f, "{}", message),
            DeviceFault::Panicked { message } => write!(f, "device task panicked: {}", message),
        }
    }
}

impl From<Error> for DeviceFault {
    fn from(e: Error) -> Self {
        match e {
            Error::Install { kind, message, .. } => DeviceFault::Install {
                reason: kind,
                message,
            },
            Error::DeviceUnreachable(_) => DeviceFault::Unreachable,
            other => DeviceFault::Communication {
                message: other.to_string(),
            },
        }
    }
}

/// Outcome of the pull phase for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PullResult {
    /// Every screenshot in the manifest was transferred
    Success { pulled: usize },
    /// Some screenshots could not be transferred
    PartialFailure {
        pulled: usize,
        missing: BTreeSet<String>,
    },
    /// The device was gone before or during the pull
    DeviceUnreachable,
}

impl PullResult {
    /// Build a result from the transferred and missing screenshot names
    pub fn from_counts(pulled: usize, missing: BTreeSet<String>) -> Self {
        if missing.is_empty() {
            PullResult::Success { pulled }
        } else {
            PullResult::PartialFailure { pulled, missing }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PullResult::Success { .. })
    }

    /// Whether at least one screenshot (or an empty manifest) arrived
    pub fn delivered(&self) -> bool {
        !matches!(self, PullResult::DeviceUnreachable)
    }
}
