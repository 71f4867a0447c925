//! CLI command definitions
//!
//! Defines the clap commands for the screenshots CLI.

use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Default build target, matching the Android Gradle plugin's test variant
pub const DEFAULT_TARGET: &str = "debugAndroidTest";

#[derive(Subcommand)]
pub enum Commands {
    /// Remove the pulled screenshots of a target
    Clean {
        /// Build target whose output directory is removed
        #[arg(default_value = DEFAULT_TARGET)]
        target: String,

        /// Build directory (default: from config, or "build")
        #[arg(long)]
        build_dir: Option<PathBuf>,

        /// Configuration file (default: ./screenshots.toml, then the user config)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Pull screenshots left on the devices by a previous test run
    Pull(RunArgs),

    /// Install, run the screenshot tests and pull the results
    Run(RunArgs),

    /// Run the screenshot tests and store the results as golden screenshots
    Record(RunArgs),

    /// Run the screenshot tests and compare them against the golden screenshots
    Verify(RunArgs),

    /// List connected devices and the names their screenshots are stored under
    Devices {
        /// Path to the adb executable
        #[arg(long)]
        adb: Option<PathBuf>,

        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Options shared by the device-facing commands
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Build target, e.g. debugAndroidTest
    #[arg(default_value = DEFAULT_TARGET)]
    pub target: String,

    /// Instrumented test APK
    #[arg(long)]
    pub apk: Option<PathBuf>,

    /// Instrumentation package (default: read from the APK with aapt)
    #[arg(long)]
    pub package: Option<String>,

    /// Instrumentation runner class
    #[arg(long)]
    pub runner: Option<String>,

    /// Directory holding the golden screenshots
    #[arg(long)]
    pub record_dir: Option<PathBuf>,

    /// Verify the already-pulled screenshots against this directory, without a device
    #[arg(long)]
    pub reference_dir: Option<PathBuf>,

    /// Directory receiving diff images for failed verifications
    #[arg(long)]
    pub failure_dir: Option<PathBuf>,

    /// Store screenshots in one folder per device (`=false` overrides the config)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub multiple_devices: Option<bool>,

    /// Fail the run when any device does not deliver all of its screenshots
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub strict_devices: Option<bool>,

    /// Test run id passed to the test process (default: a fresh UUID)
    #[arg(long)]
    pub test_run_id: Option<String>,

    /// Only handle screenshots whose name matches this regex
    #[arg(long = "filter-name-regex")]
    pub filter: Option<String>,

    /// Run only on these devices (repeatable; default: every connected device)
    #[arg(long = "serial", short = 's')]
    pub serials: Vec<String>,

    /// Path to the adb executable
    #[arg(long)]
    pub adb: Option<PathBuf>,

    /// Build directory (default: from config, or "build")
    #[arg(long)]
    pub build_dir: Option<PathBuf>,

    /// Landing directory for pulled screenshots (default: <build>/screenshots<Target>)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Configuration file (default: ./screenshots.toml, then the user config)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

impl Commands {
    /// Whether output, including errors, should be printed as JSON
    pub fn json(&self) -> bool {
        match self {
            Commands::Pull(args)
            | Commands::Run(args)
            | Commands::Record(args)
            | Commands::Verify(args) => args.json,
            Commands::Devices { json, .. } => *json,
            Commands::Clean { .. } => false,
        }
    }
}
