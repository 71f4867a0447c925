//! screenshots - on-device screenshot regression testing
//!
//! This library drives screenshot test runs: it resolves a run configuration
//! into an execution plan, fans the device work out over every connected
//! device, collects the captured screenshots, and records or verifies them.

pub mod cli;
pub mod commands;
pub mod common;
pub mod compare;
pub mod device;
pub mod manifest;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod store;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use orchestrator::TestOrchestrator;
pub use plan::{resolve, ExecutionPlan, RunConfiguration, RunMode};
pub use report::{RunReport, RunState};
