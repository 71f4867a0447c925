//! The test run state machine
//!
//! ```text
//! Idle → Cleaning → Installing → Executing → Pulling → Finalizing → Done
//!                                                                  ↘ Failed
//! ```
//!
//! Phases run strictly one after another; inside Installing, Executing and
//! Pulling the work fans out one task per device. Per-device faults are
//! recorded in the report and only exclude that device from later phases.
//! The machine itself fails only on cleaning errors, configuration problems
//! found mid-run, cancellation, or what the finalizing step decides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::{Error, Result};
use crate::compare::Comparator;
use crate::device::{
    run_across_devices, with_unique_names, DeviceDescriptor, DeviceFault, FanOutStatus,
    InstrumentationRun, PullResult, SharedSession,
};
use crate::manifest::{manifest_candidates, remote_parent, ArtifactManifest};
use crate::plan::{ExecutionPlan, Finalize, RunConfiguration, Step};
use crate::report::{FailureReason, RunReport, RunState, StepOutcome};
use crate::store::{ArtifactStore, PullJob, REPORT_FILE};

type PhaseResult = std::result::Result<(), FailureReason>;

/// Drives one invocation from cleaning to the final verdict
pub struct TestOrchestrator {
    config: RunConfiguration,
    sessions: Vec<SharedSession>,
    comparator: Box<dyn Comparator>,
    cancelled: Arc<AtomicBool>,
    state: RunState,
}

impl TestOrchestrator {
    pub fn new(
        config: RunConfiguration,
        sessions: Vec<SharedSession>,
        comparator: Box<dyn Comparator>,
    ) -> Self {
        Self {
            config,
            sessions: with_unique_names(sessions),
            comparator,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: RunState::Idle,
        }
    }

    /// Flag that stops the run at the next phase boundary once set
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Execute the plan and report the outcome
    ///
    /// Never fails: every problem ends up in the returned report, which is
    /// also written to `report.json` in the output directory.
    #[tracing::instrument(skip_all, fields(mode = %plan.mode, run_id = %self.config.test_run_id))]
    pub async fn run(&mut self, plan: &ExecutionPlan) -> RunReport {
        let mut report = RunReport::new(
            &self.config,
            self.sessions.iter().map(|s| s.descriptor().clone()),
        );

        let outcome = self.drive(plan, &mut report).await;
        match outcome {
            Ok(()) => self.transition(RunState::Done),
            Err(reason) => {
                tracing::error!(%reason, "Run failed");
                report.failure = Some(reason);
                self.transition(RunState::Failed);
            }
        }
        report.state = self.state;

        if plan.candidate_dir.is_dir() {
            if let Err(e) = report.write_json(&plan.candidate_dir.join(REPORT_FILE)) {
                tracing::warn!(error = %e, "Could not write run report");
            }
        }
        report
    }

    async fn drive(&mut self, plan: &ExecutionPlan, report: &mut RunReport) -> PhaseResult {
        let mut store = ArtifactStore::new(&plan.candidate_dir, self.config.multiple_devices);
        let mut active = self.sessions.clone();

        if plan.includes(Step::Clean) {
            self.enter(RunState::Cleaning)?;
            store.clean().map_err(|e| FailureReason::Cleaning {
                message: e.to_string(),
            })?;
            if plan.includes(Step::Execute) {
                self.clean_devices().await?;
            }
        }

        if plan.includes(Step::Install) {
            self.enter(RunState::Installing)?;
            active = self.install(&active, report).await?;
        }

        if plan.includes(Step::Execute) {
            self.enter(RunState::Executing)?;
            self.execute(&active, report).await?;
        }

        if plan.includes(Step::Pull) {
            self.enter(RunState::Pulling)?;
            self.pull(&active, &mut store, report, plan.includes(Step::Execute))
                .await?;
            self.check_delivery(report)?;
        }

        self.enter(RunState::Finalizing)?;
        self.finalize(plan, &store, report).await
    }

    /// Remove screenshots an earlier run left on the devices
    ///
    /// Best effort: a device that cannot be cleaned still runs, and a stale
    /// manifest is caught later by its run id.
    async fn clean_devices(&self) -> PhaseResult {
        let package = self.package()?;
        let result = run_across_devices(&self.sessions, move |session| {
            let package = package.clone();
            async move {
                let external = session.external_storage_dir().await?;
                if let Some(current) = manifest_candidates(&external, &package).first() {
                    session.remove_remote(remote_parent(current)).await?;
                }
                Ok(())
            }
        })
        .await;

        for (device, fault) in result.failed() {
            tracing::debug!(device = %device, %fault, "Could not clear old screenshots");
        }
        Ok(())
    }

    /// Install on every device; returns the devices that succeeded
    async fn install(
        &self,
        sessions: &[SharedSession],
        report: &mut RunReport,
    ) -> std::result::Result<Vec<SharedSession>, FailureReason> {
        let apk = self.config.apk.clone().ok_or_else(|| FailureReason::Configuration {
            message: "no test APK to install".to_string(),
        })?;
        let apk = Arc::new(apk);

        let result = run_across_devices(sessions, move |session| {
            let apk = apk.clone();
            async move { session.install(&apk).await }
        })
        .await;

        report.install_status = Some(result.status());

        let mut installed = Vec::new();
        for session in sessions {
            let device = session.descriptor();
            let Some(outcome) = result.get(device) else {
                continue;
            };
            let entry = report.device_mut(device);
            entry.install = Some(StepOutcome::from_result(outcome));
            if outcome.is_ok() {
                installed.push(session.clone());
            } else {
                entry.execute = Some(StepOutcome::Skipped);
                entry.pull = Some(StepOutcome::Skipped);
            }
        }

        tracing::info!(
            installed = installed.len(),
            devices = sessions.len(),
            "Install finished"
        );
        Ok(installed)
    }

    async fn execute(&self, sessions: &[SharedSession], report: &mut RunReport) -> PhaseResult {
        let run = Arc::new(InstrumentationRun {
            package: self.package()?,
            runner: self.config.runner.clone(),
            test_run_id: self.config.test_run_id.clone(),
        });

        let result = run_across_devices(sessions, move |session| {
            let run = run.clone();
            async move { session.execute_instrumented_tests(&run).await }
        })
        .await;

        for (device, outcome) in result.into_results() {
            let entry = report.device_mut(&device);
            entry.execute = Some(StepOutcome::from_result(&outcome));
            entry.tests = outcome.ok();
        }
        Ok(())
    }

    /// Pull manifests, claim screenshot names, then pull the files
    ///
    /// Names are claimed serially in device order between the two fan-outs,
    /// so a duplicate is reported before any image lands in the store.
    async fn pull(
        &self,
        sessions: &[SharedSession],
        store: &mut ArtifactStore,
        report: &mut RunReport,
        executed: bool,
    ) -> PhaseResult {
        let manifests_dir = store.scratch_dir().map_err(|e| FailureReason::Pulling {
            message: format!("Could not create a scratch directory for manifests: {}", e),
        })?;
        let scratch = Arc::new(manifests_dir.path().to_path_buf());
        let package = Arc::new(self.package()?);
        // Only manifests written by this run's test process can be checked
        let test_run_id = Arc::new(executed.then(|| self.config.test_run_id.clone()));
        let filter = Arc::new(self.config.filter.clone());

        let manifests = run_across_devices(sessions, move |session| {
            let scratch = scratch.clone();
            let package = package.clone();
            let test_run_id = test_run_id.clone();
            let filter = filter.clone();
            async move {
                let manifest =
                    fetch_manifest(&session, &package, &scratch, test_run_id.as_deref()).await?;
                Ok(match filter.as_ref() {
                    Some(filter) => manifest.filtered(filter),
                    None => manifest,
                })
            }
        })
        .await;

        let mut jobs: HashMap<DeviceDescriptor, Vec<PullJob>> = HashMap::new();
        for (device, outcome) in manifests.into_results() {
            match outcome {
                Ok(manifest) => {
                    let planned = store.plan_pull(&device, &manifest).map_err(|e| {
                        FailureReason::Configuration {
                            message: e.to_string(),
                        }
                    })?;
                    tracing::debug!(device = %device, screenshots = manifest.len(), "Manifest pulled");
                    jobs.insert(device, planned);
                }
                Err(fault) => record_pull_fault(report, &device, fault),
            }
        }

        let jobs = Arc::new(jobs);
        let pulling: Vec<SharedSession> = sessions
            .iter()
            .filter(|s| jobs.contains_key(s.descriptor()))
            .cloned()
            .collect();

        let pulled = run_across_devices(&pulling, move |session| {
            let jobs = jobs.clone();
            async move {
                let device_jobs = jobs
                    .get(session.descriptor())
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                pull_files(&session, device_jobs).await
            }
        })
        .await;

        for (device, outcome) in pulled.into_results() {
            match outcome {
                Ok(result) => {
                    let entry = report.device_mut(&device);
                    entry.pull = Some(StepOutcome::Succeeded);
                    entry.pulled = Some(result);
                }
                Err(fault) => record_pull_fault(report, &device, fault),
            }
        }

        if let Err(e) = store.write_metadata() {
            tracing::warn!(error = %e, "Could not write local screenshot metadata");
        }

        let status = report.aggregate_pull();
        tracing::info!(?status, "Pull finished");
        Ok(())
    }

    /// Fail the run when pulling left nothing (or, strictly, too little)
    fn check_delivery(&self, report: &RunReport) -> PhaseResult {
        match &report.pull_status {
            Some(FanOutStatus::AllFailed) | None => Err(FailureReason::NothingPulled),
            Some(FanOutStatus::PartialFailure(incomplete)) if self.config.strict_devices => {
                Err(FailureReason::IncompleteDevices {
                    devices: incomplete.iter().map(|d| d.name.clone()).collect(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Devices whose goldens a recording may replace wholesale
    ///
    /// Only devices that delivered everything qualify, so a flaky device
    /// keeps its goldens. A shared golden directory needs every device, and
    /// a name filter never replaces anything.
    fn replaceable_goldens(&self, report: &RunReport) -> Vec<DeviceDescriptor> {
        if self.config.filter.is_some() {
            return Vec::new();
        }
        let complete: Vec<DeviceDescriptor> = report
            .devices
            .iter()
            .filter(|d| d.complete())
            .map(|d| d.device.clone())
            .collect();
        if self.config.multiple_devices || complete.len() == report.devices.len() {
            complete
        } else {
            Vec::new()
        }
    }

    async fn finalize(
        &self,
        plan: &ExecutionPlan,
        store: &ArtifactStore,
        report: &mut RunReport,
    ) -> PhaseResult {
        match &plan.finalize {
            Finalize::ReportOnly => Ok(()),
            Finalize::Record { record_dir } => {
                let replace = self.replaceable_goldens(report);
                let copied = store
                    .record_into(record_dir, &replace)
                    .map_err(|e| FailureReason::Finalize {
                        message: format!(
                            "Recording into '{}' failed: {}",
                            record_dir.display(),
                            e
                        ),
                    })?;
                report.recorded = Some(copied);
                Ok(())
            }
            Finalize::Verify { reference_dir } => {
                let mut verdicts = self
                    .comparator
                    .compare(
                        &plan.candidate_dir,
                        reference_dir,
                        self.config.failure_dir.as_deref(),
                    )
                    .await
                    .map_err(|e| FailureReason::Finalize {
                        message: e.to_string(),
                    })?;

                if let Some(filter) = &self.config.filter {
                    verdicts.retain(|key, _| filter.is_match(key.rsplit('/').next().unwrap_or(key)));
                }

                let mismatched: Vec<String> = verdicts
                    .iter()
                    .filter(|(_, v)| !v.is_match())
                    .map(|(k, _)| k.clone())
                    .collect();
                tracing::info!(
                    compared = verdicts.len(),
                    mismatched = mismatched.len(),
                    "Verification finished"
                );
                report.verdicts = verdicts;

                if mismatched.is_empty() {
                    Ok(())
                } else {
                    Err(FailureReason::Mismatches { names: mismatched })
                }
            }
        }
    }

    /// Move to the next phase unless cancellation was requested
    fn enter(&mut self, next: RunState) -> PhaseResult {
        if self.cancelled.load(Ordering::SeqCst) {
            tracing::warn!(phase = %next, "Cancelled before phase");
            return Err(FailureReason::Cancelled);
        }
        self.transition(next);
        Ok(())
    }

    fn transition(&mut self, next: RunState) {
        tracing::info!(from = %self.state, to = %next, "Phase");
        self.state = next;
    }

    fn package(&self) -> std::result::Result<String, FailureReason> {
        self.config
            .package
            .clone()
            .ok_or_else(|| FailureReason::Configuration {
                message: "instrumentation package is unknown".to_string(),
            })
    }
}

/// Locate, pull and parse one device's manifest
///
/// A missing manifest means nothing was captured. A manifest left behind by
/// a different run is ignored.
async fn fetch_manifest(
    session: &SharedSession,
    package: &str,
    scratch: &std::path::Path,
    test_run_id: Option<&str>,
) -> Result<ArtifactManifest> {
    let Some(remote) = session.manifest_location(package).await? else {
        tracing::info!(device = %session.descriptor(), "No screenshots on device");
        let external = session.external_storage_dir().await?;
        let dir = manifest_candidates(&external, package)
            .first()
            .map(|c| remote_parent(c).to_string())
            .unwrap_or_default();
        return Ok(ArtifactManifest::empty(dir));
    };

    let local = tempfile::Builder::new()
        .prefix("manifest-")
        .suffix(".json")
        .tempfile_in(scratch)?;
    session.pull(&remote, local.path()).await?;

    let dir = remote_parent(&remote);
    let manifest = ArtifactManifest::load(local.path(), dir)?;
    if test_run_id.is_some_and(|id| manifest.is_stale(id)) {
        tracing::warn!(
            device = %session.descriptor(),
            "Manifest on device belongs to another test run, ignoring it"
        );
        return Ok(ArtifactManifest::empty(dir));
    }
    Ok(manifest)
}

/// Transfer every planned file, collecting screenshots that failed
async fn pull_files(session: &SharedSession, jobs: &[PullJob]) -> Result<PullResult> {
    let mut names = std::collections::BTreeSet::new();
    let mut missing = std::collections::BTreeSet::new();

    for job in jobs {
        names.insert(job.name.clone());
        match session.pull(&job.remote, &job.local).await {
            Ok(()) => {}
            Err(Error::DeviceUnreachable(device)) => return Err(Error::DeviceUnreachable(device)),
            Err(e) => {
                tracing::warn!(device = %session.descriptor(), screenshot = %job.name, error = %e, "Pull failed");
                missing.insert(job.name.clone());
            }
        }
    }

    Ok(PullResult::from_counts(names.len() - missing.len(), missing))
}

fn record_pull_fault(report: &mut RunReport, device: &DeviceDescriptor, fault: DeviceFault) {
    let entry = report.device_mut(device);
    if fault.is_unreachable() {
        entry.pulled = Some(PullResult::DeviceUnreachable);
    }
    entry.pull = Some(StepOutcome::Faulted { fault });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::InstallFailureKind;
    use crate::compare::{ComparisonVerdict, PixelComparator};
    use crate::device::{DeviceSession, ExecutionOutcome};
    use crate::plan::{resolve, RunMode};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const PACKAGE: &str = "com.example.test";
    const DEVICE_DIR: &str = "/sdcard/screenshots/com.example.test/screenshots-default";

    /// In-memory device whose test process "captures" fixed screenshots
    struct FakeDevice {
        descriptor: DeviceDescriptor,
        screenshots: Vec<(String, Vec<u8>)>,
        install_failure: Option<InstallFailureKind>,
        crash: bool,
        reachable: AtomicBool,
        drop_after_execute: bool,
        writes_manifest: bool,
        remove_fails: bool,
        /// File name whose transfer always fails
        pull_fails_for: Option<String>,
        /// Device disconnects after this many transfers
        drop_after_pulls: Option<usize>,
        /// Replaced by a regular file while the tests run
        clobber: Option<PathBuf>,
        files: Mutex<BTreeMap<String, Vec<u8>>>,
        calls: AtomicUsize,
        pulls: AtomicUsize,
    }

    impl FakeDevice {
        fn new(name: &str, screenshots: &[(&str, &str)]) -> Self {
            Self {
                descriptor: DeviceDescriptor::new(format!("serial-{}", name), name),
                screenshots: screenshots
                    .iter()
                    .map(|(n, b)| (n.to_string(), b.as_bytes().to_vec()))
                    .collect(),
                install_failure: None,
                crash: false,
                reachable: AtomicBool::new(true),
                drop_after_execute: false,
                writes_manifest: true,
                remove_fails: false,
                pull_fails_for: None,
                drop_after_pulls: None,
                clobber: None,
                files: Mutex::new(BTreeMap::new()),
                calls: AtomicUsize::new(0),
                pulls: AtomicUsize::new(0),
            }
        }

        fn with_serial(mut self, serial: &str) -> Self {
            self.descriptor.serial = serial.to_string();
            self
        }

        fn touched(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn call(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DeviceSession for FakeDevice {
        fn descriptor(&self) -> &DeviceDescriptor {
            &self.descriptor
        }

        async fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        async fn install(&self, _apk: &Path) -> Result<()> {
            self.call();
            match self.install_failure {
                Some(kind) => Err(Error::Install {
                    device: self.descriptor.name.clone(),
                    kind,
                    message: "INSTALL_FAILED".into(),
                }),
                None => Ok(()),
            }
        }

        async fn execute_instrumented_tests(
            &self,
            run: &InstrumentationRun,
        ) -> Result<ExecutionOutcome> {
            self.call();
            let mut files = self.files.lock().unwrap();
            let mut entries = Vec::new();
            if !self.writes_manifest {
                return Ok(ExecutionOutcome::Completed {
                    tests: 0,
                    failures: 0,
                });
            }
            for (name, bytes) in &self.screenshots {
                files.insert(format!("{}/{}.png", DEVICE_DIR, name), bytes.clone());
                entries.push(serde_json::json!({
                    "name": name,
                    "files": [format!("{}.png", name)],
                }));
            }
            let manifest = serde_json::json!({
                "test_run_id": run.test_run_id,
                "screenshots": entries,
            });
            files.insert(
                format!("{}/metadata.json", DEVICE_DIR),
                manifest.to_string().into_bytes(),
            );
            if self.drop_after_execute {
                self.reachable.store(false, Ordering::SeqCst);
            }
            if let Some(path) = &self.clobber {
                let _ = std::fs::remove_dir_all(path);
                std::fs::write(path, b"not a directory")?;
            }

            if self.crash {
                Ok(ExecutionOutcome::Crashed {
                    reason: "Process crashed.".into(),
                })
            } else {
                Ok(ExecutionOutcome::Completed {
                    tests: self.screenshots.len() as u32,
                    failures: 0,
                })
            }
        }

        async fn external_storage_dir(&self) -> Result<String> {
            Ok("/sdcard".into())
        }

        async fn remote_file_exists(&self, remote: &str) -> Result<bool> {
            Ok(self.files.lock().unwrap().contains_key(remote))
        }

        async fn remove_remote(&self, remote: &str) -> Result<()> {
            self.call();
            if self.remove_fails {
                return Err(Error::Adb("rm: Permission denied".into()));
            }
            self.files
                .lock()
                .unwrap()
                .retain(|path, _| !path.starts_with(remote));
            Ok(())
        }

        async fn pull(&self, remote: &str, local: &Path) -> Result<()> {
            self.call();
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(Error::DeviceUnreachable(self.descriptor.name.clone()));
            }
            if self
                .pull_fails_for
                .as_deref()
                .is_some_and(|name| remote.ends_with(name))
            {
                return Err(Error::pull(&self.descriptor.name, remote, "remote object is corrupt"));
            }
            let bytes = self
                .files
                .lock()
                .unwrap()
                .get(remote)
                .cloned()
                .ok_or_else(|| Error::pull(&self.descriptor.name, remote, "does not exist"))?;
            std::fs::create_dir_all(local.parent().unwrap())?;
            std::fs::write(local, bytes)?;
            let pulls = self.pulls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.drop_after_pulls.is_some_and(|limit| pulls >= limit) {
                self.reachable.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn config(mode: RunMode, root: &Path) -> RunConfiguration {
        RunConfiguration::new(mode, root.join("out"))
            .with_record_dir(root.join("screenshots"))
            .with_failure_dir(Some(root.join("failures")))
            .with_apk(Some(root.join("app-test.apk")))
            .with_package(Some(PACKAGE.to_string()))
    }

    async fn run_with(config: RunConfiguration, devices: Vec<Arc<FakeDevice>>) -> RunReport {
        let plan = resolve(&config).unwrap();
        let sessions: Vec<SharedSession> = devices
            .into_iter()
            .map(|d| d as SharedSession)
            .collect();
        let mut orchestrator = TestOrchestrator::new(config, sessions, Box::new(PixelComparator));
        orchestrator.run(&plan).await
    }

    #[tokio::test]
    async fn test_install_failure_only_affects_that_device() {
        let dir = tempdir().unwrap();
        let mut broken = FakeDevice::new("b", &[("home", "b")]);
        broken.install_failure = Some(InstallFailureKind::SignatureMismatch);
        let devices = vec![
            Arc::new(FakeDevice::new("a", &[("home", "a")])),
            Arc::new(broken),
            Arc::new(FakeDevice::new("c", &[("home", "c")])),
        ];

        let config = config(RunMode::Run, dir.path()).with_multiple_devices(true);
        let report = run_with(config, devices).await;

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.exit_code(), 0);
        for name in ["a", "c"] {
            let d = report.devices.iter().find(|d| d.device.name == name).unwrap();
            assert!(d.complete());
            assert!(dir.path().join("out").join(name).join("home.png").is_file());
        }
        let b = report.devices.iter().find(|d| d.device.name == "b").unwrap();
        assert!(matches!(
            b.install,
            Some(StepOutcome::Faulted {
                fault: DeviceFault::Install {
                    reason: InstallFailureKind::SignatureMismatch,
                    ..
                }
            })
        ));
        assert_eq!(b.execute, Some(StepOutcome::Skipped));
        assert_eq!(
            report.install_status,
            Some(FanOutStatus::PartialFailure(BTreeSet::from([b.device.clone()])))
        );
        assert_eq!(
            report.pull_status,
            Some(FanOutStatus::PartialFailure(BTreeSet::from([b.device.clone()])))
        );
        for name in ["a", "c"] {
            let d = report.devices.iter().find(|d| d.device.name == name).unwrap();
            assert_eq!(d.pulled, Some(PullResult::Success { pulled: 1 }));
        }
        assert!(!dir.path().join("out/b").exists());
        assert!(dir.path().join("out").join(REPORT_FILE).is_file());
    }

    #[tokio::test]
    async fn test_strict_devices_fails_on_partial_delivery() {
        let dir = tempdir().unwrap();
        let mut broken = FakeDevice::new("b", &[("home", "b")]);
        broken.install_failure = Some(InstallFailureKind::InsufficientStorage);
        let devices = vec![
            Arc::new(FakeDevice::new("a", &[("home", "a")])),
            Arc::new(broken),
        ];

        let config = config(RunMode::Run, dir.path())
            .with_multiple_devices(true)
            .with_strict_devices(true);
        let report = run_with(config, devices).await;

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(
            report.failure,
            Some(FailureReason::IncompleteDevices {
                devices: vec!["b".to_string()]
            })
        );
    }

    #[tokio::test]
    async fn test_cleaning_failure_aborts_before_devices() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("build"), b"file").unwrap();
        let device = Arc::new(FakeDevice::new("a", &[("home", "a")]));

        let config = RunConfiguration::new(RunMode::Run, dir.path().join("build/out"))
            .with_apk(Some(dir.path().join("app.apk")))
            .with_package(Some(PACKAGE.to_string()));
        let report = run_with(config, vec![device.clone()]).await;

        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(report.failure, Some(FailureReason::Cleaning { .. })));
        assert_ne!(report.exit_code(), 0);
        assert_eq!(device.touched(), 0);
    }

    #[tokio::test]
    async fn test_crashed_test_process_is_still_pulled() {
        let dir = tempdir().unwrap();
        let mut crashing = FakeDevice::new("a", &[("login", "partial")]);
        crashing.crash = true;

        let report = run_with(config(RunMode::Run, dir.path()), vec![Arc::new(crashing)]).await;

        assert_eq!(report.state, RunState::Done);
        assert!(dir.path().join("out/login.png").is_file());
        let issues = report.devices[0].issues();
        assert_eq!(issues, vec!["test process crashed: Process crashed.".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_name_without_namespacing_is_configuration_error() {
        let dir = tempdir().unwrap();
        let devices = vec![
            Arc::new(FakeDevice::new("a", &[("home", "a")])),
            Arc::new(FakeDevice::new("b", &[("home", "b")])),
        ];

        let report = run_with(config(RunMode::Run, dir.path()), devices).await;

        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(
            report.failure,
            Some(FailureReason::Configuration { .. })
        ));
        assert_eq!(report.exit_code(), 2);
        assert!(!dir.path().join("out/home.png").exists());
    }

    #[tokio::test]
    async fn test_record_then_verify_round_trip() {
        let dir = tempdir().unwrap();
        let screens: &[(&str, &str)] = &[("login", "login-v1"), ("home", "home-v1")];

        let recorded = run_with(
            config(RunMode::Record, dir.path()),
            vec![Arc::new(FakeDevice::new("a", screens))],
        )
        .await;
        assert_eq!(recorded.exit_code(), 0);
        assert_eq!(
            std::fs::read(dir.path().join("screenshots/login.png")).unwrap(),
            b"login-v1"
        );

        let verified = run_with(
            config(RunMode::Verify, dir.path()),
            vec![Arc::new(FakeDevice::new("a", screens))],
        )
        .await;
        assert_eq!(verified.exit_code(), 0);
        assert!(verified.verdicts.values().all(ComparisonVerdict::is_match));
        assert_eq!(verified.verdicts.len(), 2);

        let changed = run_with(
            config(RunMode::Verify, dir.path()),
            vec![Arc::new(FakeDevice::new(
                "a",
                &[("login", "login-v2"), ("home", "home-v1")],
            ))],
        )
        .await;
        assert_eq!(changed.exit_code(), 1);
        assert_eq!(
            changed.failure,
            Some(FailureReason::Mismatches {
                names: vec!["login".to_string()]
            })
        );
        assert!(dir.path().join("failures/login_diff.png").is_file());
    }

    #[tokio::test]
    async fn test_verify_against_reference_dir_touches_no_device() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::create_dir_all(dir.path().join("reference")).unwrap();
        std::fs::write(dir.path().join("out/login.png"), b"same").unwrap();
        std::fs::write(dir.path().join("reference/login.png"), b"same").unwrap();
        let device = Arc::new(FakeDevice::new("a", &[]));

        let config = RunConfiguration::new(RunMode::Verify, dir.path().join("out"))
            .with_reference_dir(Some(dir.path().join("reference")));
        let report = run_with(config, vec![device.clone()]).await;

        assert_eq!(report.exit_code(), 0);
        assert_eq!(device.touched(), 0);
        assert!(dir.path().join("out/login.png").is_file());
    }

    #[tokio::test]
    async fn test_device_dropping_before_pull_is_unreachable() {
        let dir = tempdir().unwrap();
        let mut dropping = FakeDevice::new("b", &[("settings", "b")]);
        dropping.drop_after_execute = true;
        let devices = vec![
            Arc::new(FakeDevice::new("a", &[("home", "a")])),
            Arc::new(dropping),
        ];

        let report = run_with(config(RunMode::Run, dir.path()), devices).await;

        assert_eq!(report.state, RunState::Done);
        let b = report.devices.iter().find(|d| d.device.name == "b").unwrap();
        assert_eq!(b.pulled, Some(PullResult::DeviceUnreachable));
        assert!(dir.path().join("out/home.png").is_file());
    }

    #[tokio::test]
    async fn test_all_devices_unreachable_fails_run() {
        let dir = tempdir().unwrap();
        let gone = FakeDevice::new("a", &[("home", "a")]);
        gone.reachable.store(false, Ordering::SeqCst);

        let report = run_with(config(RunMode::Record, dir.path()), vec![Arc::new(gone)]).await;

        assert_eq!(report.failure, Some(FailureReason::NothingPulled));
        assert!(!dir.path().join("screenshots").exists());
    }

    #[tokio::test]
    async fn test_filter_limits_pulled_screenshots() {
        let dir = tempdir().unwrap();
        let device = Arc::new(FakeDevice::new("a", &[("login", "l"), ("home", "h")]));

        let config = config(RunMode::Run, dir.path())
            .with_filter(Some(regex::Regex::new("^log").unwrap()));
        let report = run_with(config, vec![device]).await;

        assert_eq!(report.devices[0].pulled, Some(PullResult::Success { pulled: 1 }));
        assert!(dir.path().join("out/login.png").is_file());
        assert!(!dir.path().join("out/home.png").exists());
    }

    fn with_leftovers(mut device: FakeDevice) -> FakeDevice {
        device.writes_manifest = false;
        device.remove_fails = true;
        let mut files = device.files.lock().unwrap();
        files.insert(
            format!("{}/metadata.json", DEVICE_DIR),
            br#"{"test_run_id": "old-run", "screenshots": [{"name": "old", "files": ["old.png"]}]}"#
                .to_vec(),
        );
        files.insert(format!("{}/old.png", DEVICE_DIR), b"old".to_vec());
        drop(files);
        device
    }

    #[tokio::test]
    async fn test_manifest_from_another_run_is_ignored() {
        let dir = tempdir().unwrap();
        let device = Arc::new(with_leftovers(FakeDevice::new("a", &[])));

        let report = run_with(config(RunMode::Run, dir.path()), vec![device]).await;

        assert_eq!(report.devices[0].pulled, Some(PullResult::Success { pulled: 0 }));
        assert!(!dir.path().join("out/old.png").exists());
    }

    #[tokio::test]
    async fn test_pull_retrieves_previous_run() {
        let dir = tempdir().unwrap();
        let device = Arc::new(with_leftovers(FakeDevice::new("a", &[])));

        let config = config(RunMode::Pull, dir.path()).with_apk(None);
        let report = run_with(config, vec![device]).await;

        assert_eq!(report.devices[0].pulled, Some(PullResult::Success { pulled: 1 }));
        assert_eq!(std::fs::read(dir.path().join("out/old.png")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_at_phase_boundary() {
        let dir = tempdir().unwrap();
        let device = Arc::new(FakeDevice::new("a", &[("home", "a")]));
        let config = config(RunMode::Run, dir.path());
        let plan = resolve(&config).unwrap();

        let mut orchestrator = TestOrchestrator::new(
            config,
            vec![device.clone() as SharedSession],
            Box::new(PixelComparator),
        );
        orchestrator.cancellation().store(true, Ordering::SeqCst);
        let report = orchestrator.run(&plan).await;

        assert_eq!(report.failure, Some(FailureReason::Cancelled));
        assert_eq!(orchestrator.state(), RunState::Failed);
        assert_eq!(device.touched(), 0);
    }

    #[tokio::test]
    async fn test_record_keeps_goldens_of_devices_that_did_not_deliver() {
        let dir = tempdir().unwrap();
        let first = vec![
            Arc::new(FakeDevice::new("a", &[("home", "a-v1"), ("retired", "a-v1")])),
            Arc::new(FakeDevice::new("b", &[("home", "b-v1")])),
        ];
        let config = config(RunMode::Record, dir.path()).with_multiple_devices(true);
        assert_eq!(run_with(config.clone(), first).await.exit_code(), 0);

        let gone = FakeDevice::new("b", &[("home", "b-v2")]);
        gone.reachable.store(false, Ordering::SeqCst);
        let second = vec![Arc::new(FakeDevice::new("a", &[("home", "a-v2")])), Arc::new(gone)];
        let report = run_with(config, second).await;

        assert_eq!(report.state, RunState::Done);
        let goldens = dir.path().join("screenshots");
        assert_eq!(std::fs::read(goldens.join("a/home.png")).unwrap(), b"a-v2");
        assert!(!goldens.join("a/retired.png").exists());
        assert_eq!(std::fs::read(goldens.join("b/home.png")).unwrap(), b"b-v1");
    }

    #[tokio::test]
    async fn test_record_keeps_golden_of_screenshot_that_failed_to_pull() {
        let dir = tempdir().unwrap();
        let screens: &[(&str, &str)] = &[("login", "login-v1"), ("home", "home-v1")];
        let recorded = run_with(
            config(RunMode::Record, dir.path()),
            vec![Arc::new(FakeDevice::new("a", screens))],
        )
        .await;
        assert_eq!(recorded.exit_code(), 0);

        let mut flaky = FakeDevice::new("a", &[("login", "login-v2"), ("home", "home-v2")]);
        flaky.pull_fails_for = Some("home.png".to_string());
        let report = run_with(config(RunMode::Record, dir.path()), vec![Arc::new(flaky)]).await;

        assert_eq!(report.state, RunState::Done);
        let goldens = dir.path().join("screenshots");
        assert_eq!(std::fs::read(goldens.join("login.png")).unwrap(), b"login-v2");
        assert_eq!(std::fs::read(goldens.join("home.png")).unwrap(), b"home-v1");
    }

    #[tokio::test]
    async fn test_failed_file_pull_surfaces_as_missing_candidate() {
        let dir = tempdir().unwrap();
        let screens: &[(&str, &str)] = &[("login", "login-v1"), ("home", "home-v1")];
        run_with(
            config(RunMode::Record, dir.path()),
            vec![Arc::new(FakeDevice::new("a", screens))],
        )
        .await;

        let mut flaky = FakeDevice::new("a", screens);
        flaky.pull_fails_for = Some("home.png".to_string());
        let report = run_with(config(RunMode::Verify, dir.path()), vec![Arc::new(flaky)]).await;

        assert_eq!(
            report.devices[0].pulled,
            Some(PullResult::PartialFailure {
                pulled: 1,
                missing: BTreeSet::from(["home".to_string()]),
            })
        );
        assert_eq!(report.verdicts.get("home"), Some(&ComparisonVerdict::MissingCandidate));
        assert_eq!(report.verdicts.get("login"), Some(&ComparisonVerdict::Match));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(
            report.failure,
            Some(FailureReason::Mismatches {
                names: vec!["home".to_string()]
            })
        );
    }

    #[tokio::test]
    async fn test_device_dropping_mid_transfer_is_unreachable() {
        let dir = tempdir().unwrap();
        // Manifest plus the first image, then the device goes away
        let mut dropping = FakeDevice::new("b", &[("home", "b"), ("login", "b")]);
        dropping.drop_after_pulls = Some(2);
        let devices = vec![
            Arc::new(FakeDevice::new("a", &[("home", "a")])),
            Arc::new(dropping),
        ];

        let config = config(RunMode::Run, dir.path()).with_multiple_devices(true);
        let report = run_with(config, devices).await;

        assert_eq!(report.state, RunState::Done);
        let b = report.devices.iter().find(|d| d.device.name == "b").unwrap();
        assert_eq!(b.pulled, Some(PullResult::DeviceUnreachable));
        assert!(matches!(
            b.pull,
            Some(StepOutcome::Faulted {
                fault: DeviceFault::Unreachable
            })
        ));
        assert_eq!(
            report.pull_status,
            Some(FanOutStatus::PartialFailure(BTreeSet::from([b.device.clone()])))
        );
    }

    #[tokio::test]
    async fn test_identical_devices_get_separate_namespaces() {
        let dir = tempdir().unwrap();
        let name = "API_30_GP_XXHDPI_1080x1920_x86_64_en-US";
        let devices = vec![
            Arc::new(FakeDevice::new(name, &[("home", "first")]).with_serial("emulator-5554")),
            Arc::new(FakeDevice::new(name, &[("home", "second")]).with_serial("emulator-5556")),
        ];

        let config = config(RunMode::Run, dir.path()).with_multiple_devices(true);
        let report = run_with(config, devices).await;

        assert_eq!(report.state, RunState::Done);
        let out = dir.path().join("out");
        assert_eq!(
            std::fs::read(out.join(format!("{}_emulator-5554/home.png", name))).unwrap(),
            b"first"
        );
        assert_eq!(
            std::fs::read(out.join(format!("{}_emulator-5556/home.png", name))).unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn test_serials_mapping_to_same_file_name_keep_their_manifests() {
        let dir = tempdir().unwrap();
        let devices = vec![
            Arc::new(FakeDevice::new("a", &[("home", "a")]).with_serial("host:5555")),
            Arc::new(
                FakeDevice::new("b", &[("home", "b"), ("login", "b")]).with_serial("host_5555"),
            ),
        ];

        let config = config(RunMode::Run, dir.path()).with_multiple_devices(true);
        let report = run_with(config, devices).await;

        assert_eq!(report.state, RunState::Done);
        let pulled = |name: &str| {
            report
                .devices
                .iter()
                .find(|d| d.device.name == name)
                .and_then(|d| d.pulled.clone())
        };
        assert_eq!(pulled("a"), Some(PullResult::Success { pulled: 1 }));
        assert_eq!(pulled("b"), Some(PullResult::Success { pulled: 2 }));
        assert!(!dir.path().join("out/a/login.png").exists());
    }

    #[tokio::test]
    async fn test_scratch_failure_is_a_pulling_failure() {
        let dir = tempdir().unwrap();
        let mut device = FakeDevice::new("a", &[("home", "a")]);
        device.clobber = Some(dir.path().join("out"));

        let report = run_with(config(RunMode::Run, dir.path()), vec![Arc::new(device)]).await;

        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(report.failure, Some(FailureReason::Pulling { .. })));
        assert_eq!(report.exit_code(), 1);
    }
}
