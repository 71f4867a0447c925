//! CLI command handling
//!
//! Merges flags with the configuration file, connects to devices, and hands
//! the resolved plan to the orchestrator. Returns the process exit code.

use colored::Colorize;
use regex::Regex;
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::commands::{Commands, RunArgs};
use crate::common::config::Config;
use crate::common::{paths, Error, Result};
use crate::compare::PixelComparator;
use crate::device::adb::{self, Adb};
use crate::device::{DeviceSession, SharedSession};
use crate::orchestrator::TestOrchestrator;
use crate::plan::{self, RunConfiguration, RunMode};
use crate::store::ArtifactStore;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Clean {
            target,
            build_dir,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let build_dir = build_dir.unwrap_or(config.screenshots.build_dir);
            let dir = paths::target_output_dir(&build_dir, &target);

            ArtifactStore::new(&dir, false).clean()?;
            println!("Cleaned {}", dir.display());
            Ok(0)
        }

        Commands::Pull(args) => run(RunMode::Pull, args).await,
        Commands::Run(args) => run(RunMode::Run, args).await,
        Commands::Record(args) => run(RunMode::Record, args).await,
        Commands::Verify(args) => run(RunMode::Verify, args).await,

        Commands::Devices { adb, config, json } => {
            let config = load_config(config.as_deref())?;
            let adb = Adb::locate(
                adb.or(config.device.adb).as_deref(),
                config.timeouts.clone(),
            )?;
            let sessions = adb.connect(&[]).await?;

            if json {
                let devices: Vec<_> = sessions
                    .iter()
                    .map(|s| serde_json::json!({
                        "serial": s.descriptor().serial,
                        "name": s.descriptor().name,
                    }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if sessions.is_empty() {
                println!("No devices connected");
            } else {
                for session in &sessions {
                    let d = session.descriptor();
                    println!("  {} {:20} {}", "✓".green(), d.serial, d.name);
                }
            }
            Ok(0)
        }
    }
}

async fn run(mode: RunMode, args: RunArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let mut run_config = build_configuration(mode, &args, &config)?;

    if run_config.package.is_none() {
        if let Some(apk) = &run_config.apk {
            match adb::resolve_package(apk).await {
                Ok(package) => {
                    tracing::debug!(package = %package, "Resolved instrumentation package");
                    run_config.package = Some(package);
                }
                Err(e) => tracing::warn!(error = %e, "Could not read the package name from the APK"),
            }
        }
    }

    let plan = plan::resolve(&run_config)?;
    tracing::debug!(?plan, "Resolved execution plan");

    let sessions: Vec<SharedSession> = if plan.touches_devices() {
        let adb = Adb::locate(
            args.adb.clone().or(config.device.adb.clone()).as_deref(),
            config.timeouts.clone(),
        )?;
        let serials = if args.serials.is_empty() {
            config.device.serials.clone()
        } else {
            args.serials.clone()
        };
        let sessions: Vec<SharedSession> = adb
            .connect(&serials)
            .await?
            .into_iter()
            .map(|s| std::sync::Arc::new(s) as SharedSession)
            .collect();
        if sessions.is_empty() {
            return Err(Error::config("No devices connected"));
        }
        sessions
    } else {
        Vec::new()
    };

    let mut orchestrator = TestOrchestrator::new(run_config, sessions, Box::new(PixelComparator));

    let cancelled = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current phase");
            cancelled.store(true, Ordering::SeqCst);
        }
    });

    let report = orchestrator.run(&plan).await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print();
    }
    Ok(report.exit_code())
}

/// Load the given config file, or the default lookup chain
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Merge flags over the configuration file into one run configuration
fn build_configuration(mode: RunMode, args: &RunArgs, config: &Config) -> Result<RunConfiguration> {
    let settings = &config.screenshots;
    let build_dir = args.build_dir.as_deref().unwrap_or(&settings.build_dir);
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| paths::target_output_dir(build_dir, &args.target));

    let filter = args
        .filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| Error::config(format!("Invalid --filter-name-regex: {}", e)))?;

    let mut run_config = RunConfiguration::new(mode, output_dir)
        .with_record_dir(
            args.record_dir
                .clone()
                .unwrap_or_else(|| settings.record_dir.clone()),
        )
        .with_reference_dir(args.reference_dir.clone().or(settings.reference_dir.clone()))
        .with_failure_dir(args.failure_dir.clone().or(settings.failure_dir.clone()))
        .with_multiple_devices(args.multiple_devices.unwrap_or(settings.multiple_devices))
        .with_strict_devices(args.strict_devices.unwrap_or(settings.strict_devices))
        .with_apk(args.apk.clone())
        .with_package(args.package.clone())
        .with_runner(
            args.runner
                .clone()
                .unwrap_or_else(|| config.device.runner.clone()),
        )
        .with_filter(filter);

    if let Some(id) = &args.test_run_id {
        run_config = run_config.with_test_run_id(id.clone());
    }
    Ok(run_config)
}
