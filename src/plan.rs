//! Run configuration and execution planning
//!
//! One immutable `RunConfiguration` is built per invocation and resolved into
//! an `ExecutionPlan`: the ordered device steps plus what the finalizing step
//! does with the pulled artifacts. The orchestrator only ever looks at the
//! plan, so record, verify, run and pull share one driver.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};

/// What an invocation does with the screenshots it collects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Install, execute, pull, report
    Run,
    /// Install, execute, pull, store as golden references
    Record,
    /// Install, execute, pull, compare against golden references
    Verify,
    /// Pull whatever a previous on-device run left behind, report
    Pull,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Run => write!(f, "run"),
            RunMode::Record => write!(f, "record"),
            RunMode::Verify => write!(f, "verify"),
            RunMode::Pull => write!(f, "pull"),
        }
    }
}

/// Everything one invocation needs, fixed before any work starts
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    pub mode: RunMode,
    /// Golden screenshot directory
    pub record_dir: PathBuf,
    /// External reference directory; verify compares against it without a device
    pub reference_dir: Option<PathBuf>,
    /// Where diff artifacts for mismatches are written
    pub failure_dir: Option<PathBuf>,
    /// Namespace stored screenshots by device name
    pub multiple_devices: bool,
    /// Treat any device that failed to deliver screenshots as a run failure
    pub strict_devices: bool,
    /// Unique id of this invocation, passed to the on-device test process
    pub test_run_id: String,
    /// Landing zone for pulled artifacts (cleaned at the start of a run)
    pub output_dir: PathBuf,
    /// Instrumented test APK
    pub apk: Option<PathBuf>,
    /// Instrumentation package name
    pub package: Option<String>,
    /// Instrumentation runner class
    pub runner: String,
    /// Only screenshots whose name matches are pulled
    pub filter: Option<Regex>,
}

impl RunConfiguration {
    /// Create a configuration with the documented defaults
    pub fn new(mode: RunMode, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            record_dir: PathBuf::from("screenshots"),
            reference_dir: None,
            failure_dir: None,
            multiple_devices: false,
            strict_devices: false,
            test_run_id: new_test_run_id(),
            output_dir: output_dir.into(),
            apk: None,
            package: None,
            runner: "androidx.test.runner.AndroidJUnitRunner".to_string(),
            filter: None,
        }
    }

    pub fn with_record_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_dir = dir.into();
        self
    }

    pub fn with_reference_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.reference_dir = dir;
        self
    }

    pub fn with_failure_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.failure_dir = dir;
        self
    }

    pub fn with_multiple_devices(mut self, enabled: bool) -> Self {
        self.multiple_devices = enabled;
        self
    }

    pub fn with_strict_devices(mut self, enabled: bool) -> Self {
        self.strict_devices = enabled;
        self
    }

    pub fn with_test_run_id(mut self, id: impl Into<String>) -> Self {
        self.test_run_id = id.into();
        self
    }

    pub fn with_apk(mut self, apk: Option<PathBuf>) -> Self {
        self.apk = apk;
        self
    }

    pub fn with_package(mut self, package: Option<String>) -> Self {
        self.package = package;
        self
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    pub fn with_filter(mut self, filter: Option<Regex>) -> Self {
        self.filter = filter;
        self
    }
}

/// Generate a fresh test run id
pub fn new_test_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A device-facing step of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Clean,
    Install,
    Execute,
    Pull,
}

/// What happens once every device's pull result is in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finalize {
    /// Copy the pulled screenshots into the golden directory
    Record { record_dir: PathBuf },
    /// Compare the candidates against a golden directory
    Verify { reference_dir: PathBuf },
    /// Only report what was pulled
    ReportOnly,
}

/// Resolved plan for one invocation
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub mode: RunMode,
    pub steps: Vec<Step>,
    /// Directory holding the candidate screenshots
    pub candidate_dir: PathBuf,
    pub finalize: Finalize,
}

impl ExecutionPlan {
    /// Whether the plan contains the given step
    pub fn includes(&self, step: Step) -> bool {
        self.steps.contains(&step)
    }

    /// Whether any connected device is needed
    pub fn touches_devices(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, Step::Install | Step::Execute | Step::Pull))
    }
}

/// Resolve a configuration into an execution plan
///
/// Fails with a configuration error before anything is touched when the plan
/// could not possibly succeed (nothing to compare against, no APK to install).
pub fn resolve(config: &RunConfiguration) -> Result<ExecutionPlan> {
    use Step::*;

    let device_steps = vec![Clean, Install, Execute, Pull];

    let (steps, finalize) = match config.mode {
        RunMode::Verify => match &config.reference_dir {
            Some(reference) => {
                require_dir(reference, "reference directory")?;
                require_dir(&config.output_dir, "screenshot directory to verify")?;
                (
                    Vec::new(),
                    Finalize::Verify {
                        reference_dir: reference.clone(),
                    },
                )
            }
            None => {
                if !config.record_dir.is_dir() {
                    return Err(Error::config(format!(
                        "Nothing to verify against: record directory '{}' does not exist. \
                         Record screenshots first or set a reference directory",
                        config.record_dir.display()
                    )));
                }
                (
                    device_steps,
                    Finalize::Verify {
                        reference_dir: config.record_dir.clone(),
                    },
                )
            }
        },
        RunMode::Record => (
            device_steps,
            Finalize::Record {
                record_dir: config.record_dir.clone(),
            },
        ),
        RunMode::Run => (device_steps, Finalize::ReportOnly),
        RunMode::Pull => (vec![Clean, Pull], Finalize::ReportOnly),
    };

    let plan = ExecutionPlan {
        mode: config.mode,
        steps,
        candidate_dir: config.output_dir.clone(),
        finalize,
    };

    if plan.includes(Install) && config.apk.is_none() {
        return Err(Error::config(format!(
            "'{}' installs the test APK, but no APK was given",
            config.mode
        )));
    }
    if plan.touches_devices() && config.package.is_none() {
        return Err(Error::config(
            "Instrumentation package is unknown. Pass --package or an APK aapt can read",
        ));
    }

    Ok(plan)
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(Error::config(format!(
            "The {} '{}' does not exist",
            what,
            path.display()
        )))
    }
}
