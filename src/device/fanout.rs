//! Running one operation across many devices
//!
//! Every device gets its own task, so a slow, failing or panicking device
//! never holds up or takes down its siblings. Faults are collected per
//! device; nothing raised by a device propagates past this module.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use super::{DeviceDescriptor, DeviceFault, DeviceSession, PullResult};
use crate::common::Result;

/// Session handle shared between the orchestrator and per-device tasks
pub type SharedSession = Arc<dyn DeviceSession>;

/// Aggregate status of a fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "devices", rename_all = "snake_case")]
pub enum FanOutStatus {
    AllSucceeded,
    PartialFailure(BTreeSet<DeviceDescriptor>),
    /// Every device failed, or there were no devices at all
    AllFailed,
}

impl FanOutStatus {
    /// Aggregate the pull phase over every device of the run
    ///
    /// A device without a `PullResult` never got to pull. Devices that did
    /// not hand over everything make up the `PartialFailure` set; the phase
    /// only counts as `AllFailed` when no device delivered anything.
    pub fn of_pull<'a>(
        results: impl IntoIterator<Item = (&'a DeviceDescriptor, Option<&'a PullResult>)>,
    ) -> Self {
        let mut incomplete = BTreeSet::new();
        let mut delivered = false;
        for (device, result) in results {
            delivered |= result.is_some_and(PullResult::delivered);
            if !result.is_some_and(PullResult::is_success) {
                incomplete.insert(device.clone());
            }
        }

        if !delivered {
            FanOutStatus::AllFailed
        } else if incomplete.is_empty() {
            FanOutStatus::AllSucceeded
        } else {
            FanOutStatus::PartialFailure(incomplete)
        }
    }
}

/// Per-device results of one fan-out
#[derive(Debug)]
pub struct FanOutResult<T> {
    results: BTreeMap<DeviceDescriptor, std::result::Result<T, DeviceFault>>,
}

impl<T> FanOutResult<T> {
    /// Aggregate the per-device results
    pub fn status(&self) -> FanOutStatus {
        let failed: BTreeSet<DeviceDescriptor> = self
            .results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(d, _)| d.clone())
            .collect();

        if self.results.is_empty() || failed.len() == self.results.len() {
            FanOutStatus::AllFailed
        } else if failed.is_empty() {
            FanOutStatus::AllSucceeded
        } else {
            FanOutStatus::PartialFailure(failed)
        }
    }

    pub fn get(&self, device: &DeviceDescriptor) -> Option<&std::result::Result<T, DeviceFault>> {
        self.results.get(device)
    }

    /// Devices whose operation failed, with their faults
    pub fn failed(&self) -> impl Iterator<Item = (&DeviceDescriptor, &DeviceFault)> {
        self.results
            .iter()
            .filter_map(|(d, r)| r.as_ref().err().map(|f| (d, f)))
    }

    pub fn into_results(self) -> BTreeMap<DeviceDescriptor, std::result::Result<T, DeviceFault>> {
        self.results
    }
}

/// Run `op` against every session independently
///
/// Reachability is checked before `op` starts on a device; an unreachable
/// device is reported as `DeviceFault::Unreachable` without running `op`.
/// A single session is awaited in place. No ordering between devices.
pub async fn run_across_devices<T, F, Fut>(sessions: &[SharedSession], op: F) -> FanOutResult<T>
where
    T: Send + 'static,
    F: Fn(SharedSession) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let mut results = BTreeMap::new();

    if let [session] = sessions {
        let descriptor = session.descriptor().clone();
        let outcome = guarded(session.clone(), op(session.clone())).await;
        log_fault(&descriptor, &outcome);
        results.insert(descriptor, outcome);
        return FanOutResult { results };
    }

    let handles: Vec<_> = sessions
        .iter()
        .map(|session| {
            let descriptor = session.descriptor().clone();
            let task = tokio::spawn(guarded(session.clone(), op(session.clone())));
            (descriptor, task)
        })
        .collect();

    for (descriptor, task) in handles {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(DeviceFault::Panicked {
                message: e.to_string(),
            }),
        };
        log_fault(&descriptor, &outcome);
        results.insert(descriptor, outcome);
    }

    FanOutResult { results }
}

async fn guarded<T, Fut>(session: SharedSession, op: Fut) -> std::result::Result<T, DeviceFault>
where
    Fut: Future<Output = Result<T>>,
{
    if !session.is_reachable().await {
        return Err(DeviceFault::Unreachable);
    }
    op.await.map_err(DeviceFault::from)
}

fn log_fault<T>(device: &DeviceDescriptor, outcome: &std::result::Result<T, DeviceFault>) {
    if let Err(fault) = outcome {
        tracing::warn!(device = %device, %fault, "Device operation failed");
    }
}
