//! Run report
//!
//! Everything one invocation did, per device and per screenshot. The report
//! is printed for humans, written as `report.json` for the HTML report
//! renderer, and decides the process exit code.

use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::common::Result;
use crate::compare::ComparisonVerdict;
use crate::device::{DeviceDescriptor, DeviceFault, ExecutionOutcome, FanOutStatus, PullResult};
use crate::plan::{RunConfiguration, RunMode};

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Cleaning,
    Installing,
    Executing,
    Pulling,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Cleaning => "cleaning",
            RunState::Installing => "installing",
            RunState::Executing => "executing",
            RunState::Pulling => "pulling",
            RunState::Finalizing => "finalizing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a run ended `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Stopped at a phase boundary on request
    Cancelled,
    /// The landing directory could not be cleaned
    Cleaning { message: String },
    /// The run could not proceed with the given settings
    Configuration { message: String },
    /// The pull phase could not run at all
    Pulling { message: String },
    /// No device delivered any screenshots
    NothingPulled,
    /// `strict_devices` is set and these devices did not deliver everything
    IncompleteDevices { devices: Vec<String> },
    /// Screenshots that did not match their golden
    Mismatches { names: Vec<String> },
    /// Recording or comparing the pulled screenshots failed
    Finalize { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Cleaning { message } => write!(f, "{}", message),
            FailureReason::Configuration { message } => write!(f, "{}", message),
            FailureReason::Pulling { message } => write!(f, "{}", message),
            FailureReason::NothingPulled => write!(f, "no device delivered screenshots"),
            FailureReason::IncompleteDevices { devices } => write!(
                f,
                "devices did not deliver every screenshot: {}",
                devices.join(", ")
            ),
            FailureReason::Mismatches { names } => {
                write!(f, "{} screenshot(s) differ: {}", names.len(), names.join(", "))
            }
            FailureReason::Finalize { message } => write!(f, "{}", message),
        }
    }
}

/// Result of one device step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Faulted { fault: DeviceFault },
    /// Not attempted because an earlier step failed on this device
    Skipped,
}

impl StepOutcome {
    pub fn from_result<T>(result: &std::result::Result<T, DeviceFault>) -> Self {
        match result {
            Ok(_) => StepOutcome::Succeeded,
            Err(fault) => StepOutcome::Faulted {
                fault: fault.clone(),
            },
        }
    }

    fn fault(&self) -> Option<&DeviceFault> {
        match self {
            StepOutcome::Faulted { fault } => Some(fault),
            _ => None,
        }
    }
}

/// What happened on one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device: DeviceDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute: Option<StepOutcome>,
    /// How the test process ended, when it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<ExecutionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull: Option<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulled: Option<PullResult>,
}

impl DeviceReport {
    pub fn new(device: DeviceDescriptor) -> Self {
        Self {
            device,
            install: None,
            execute: None,
            tests: None,
            pull: None,
            pulled: None,
        }
    }

    /// Whether this device handed over any screenshots (or an empty manifest)
    pub fn delivered(&self) -> bool {
        self.pulled.as_ref().is_some_and(PullResult::delivered)
    }

    /// Whether this device handed over everything it captured
    pub fn complete(&self) -> bool {
        self.pulled.as_ref().is_some_and(PullResult::is_success)
    }

    /// Infrastructure problems on this device, one line each
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for (step, outcome) in [
            ("install", &self.install),
            ("execute", &self.execute),
            ("pull", &self.pull),
        ] {
            if let Some(fault) = outcome.as_ref().and_then(StepOutcome::fault) {
                issues.push(format!("{}: {}", step, fault));
            }
        }
        if let Some(ExecutionOutcome::Crashed { reason }) = &self.tests {
            issues.push(format!("test process crashed: {}", reason));
        }
        if let Some(PullResult::PartialFailure { missing, .. }) = &self.pulled {
            issues.push(format!(
                "missing screenshots: {}",
                missing.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        issues
    }
}

/// Outcome of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub test_run_id: String,
    pub output_dir: PathBuf,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub devices: Vec<DeviceReport>,
    /// Aggregate of the install fan-out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_status: Option<FanOutStatus>,
    /// Aggregate of the pull phase over every device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_status: Option<FanOutStatus>,
    /// Screenshot key → verdict (verify only)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub verdicts: BTreeMap<String, ComparisonVerdict>,
    /// Files copied into the golden directory (record only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded: Option<usize>,
}

impl RunReport {
    pub fn new(config: &RunConfiguration, devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        Self {
            mode: config.mode,
            test_run_id: config.test_run_id.clone(),
            output_dir: config.output_dir.clone(),
            state: RunState::Idle,
            failure: None,
            devices: devices.into_iter().map(DeviceReport::new).collect(),
            install_status: None,
            pull_status: None,
            verdicts: BTreeMap::new(),
            recorded: None,
        }
    }

    /// Per-device entry, created on first use
    pub fn device_mut(&mut self, device: &DeviceDescriptor) -> &mut DeviceReport {
        let idx = match self.devices.iter().position(|d| &d.device == device) {
            Some(idx) => idx,
            None => {
                self.devices.push(DeviceReport::new(device.clone()));
                self.devices.len() - 1
            }
        };
        &mut self.devices[idx]
    }

    /// Process exit code: 0 done, 1 failed, 2 configuration error
    pub fn exit_code(&self) -> i32 {
        match (&self.state, &self.failure) {
            (RunState::Done, _) => 0,
            (_, Some(FailureReason::Configuration { .. })) => 2,
            _ => 1,
        }
    }

    /// Aggregate the devices' pull results into `pull_status`
    pub fn aggregate_pull(&mut self) -> &FanOutStatus {
        let status = FanOutStatus::of_pull(
            self.devices
                .iter()
                .map(|d| (&d.device, d.pulled.as_ref())),
        );
        self.pull_status.insert(status)
    }

    /// Screenshots whose verdict is not `Match`
    pub fn regressions(&self) -> impl Iterator<Item = (&String, &ComparisonVerdict)> {
        self.verdicts.iter().filter(|(_, v)| !v.is_match())
    }

    /// Devices with infrastructure problems, with their issues
    pub fn infrastructure_issues(&self) -> Vec<(&DeviceDescriptor, Vec<String>)> {
        self.devices
            .iter()
            .map(|d| (&d.device, d.issues()))
            .filter(|(_, issues)| !issues.is_empty())
            .collect()
    }

    /// Write the report as pretty JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Print a human-readable summary to stdout
    pub fn print(&self) {
        println!();
        println!(
            "{} {} (run {})",
            "Screenshot".bold(),
            self.mode.to_string().bold(),
            self.test_run_id.dimmed()
        );

        for device in &self.devices {
            let pulled = match &device.pulled {
                Some(PullResult::Success { pulled }) => format!("{} pulled", pulled),
                Some(PullResult::PartialFailure { pulled, missing }) => {
                    format!("{} pulled, {} missing", pulled, missing.len())
                }
                Some(PullResult::DeviceUnreachable) => "unreachable".to_string(),
                None => "nothing pulled".to_string(),
            };
            let mark = if device.issues().is_empty() {
                "✓".green()
            } else {
                "!".yellow()
            };
            println!("  {} {} {}", mark, device.device, pulled.dimmed());
        }

        if let Some(FanOutStatus::PartialFailure(incomplete)) = &self.pull_status {
            println!(
                "\n  {} of {} devices delivered every screenshot",
                self.devices.len() - incomplete.len(),
                self.devices.len()
            );
        }

        let issues = self.infrastructure_issues();
        if !issues.is_empty() {
            println!("\n{}", "Infrastructure".yellow().bold());
            for (device, lines) in issues {
                for line in lines {
                    println!("  {} {}: {}", "!".yellow(), device.name, line);
                }
            }
        }

        let regressions: Vec<_> = self.regressions().collect();
        if !regressions.is_empty() {
            println!("\n{}", "Regressions".red().bold());
            for (name, verdict) in regressions {
                let detail = match verdict {
                    ComparisonVerdict::Mismatch { diff: Some(diff) } => {
                        format!("differs, see {}", diff.display())
                    }
                    ComparisonVerdict::Mismatch { diff: None } => "differs".to_string(),
                    ComparisonVerdict::MissingReference => "no recorded screenshot".to_string(),
                    ComparisonVerdict::MissingCandidate => "not captured".to_string(),
                    ComparisonVerdict::Match => continue,
                };
                println!("  {} {}: {}", "✗".red(), name, detail);
            }
        }

        if !self.verdicts.is_empty() {
            let matched = self.verdicts.values().filter(|v| v.is_match()).count();
            println!("\n  {}/{} screenshots match", matched, self.verdicts.len());
        }
        if let Some(recorded) = self.recorded {
            println!("\n  Recorded {} files", recorded);
        }

        match (&self.state, &self.failure) {
            (RunState::Done, _) => println!("\n{} {}\n", "✓".green().bold(), "Done".green().bold()),
            (_, Some(reason)) => println!(
                "\n{} {}: {}\n",
                "✗".red().bold(),
                "Failed".red().bold(),
                reason
            ),
            _ => println!("\n{} {}\n", "✗".red().bold(), "Failed".red().bold()),
        }
    }
}
