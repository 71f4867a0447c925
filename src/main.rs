//! screenshots - on-device screenshot regression testing
//!
//! Installs an instrumented test APK, runs the screenshot tests on every
//! connected device, pulls the captured screenshots and records them as
//! golden references or verifies them against the recorded ones.

use clap::Parser;
use screenshots::{cli, commands::Commands, common::logging};

#[derive(Parser)]
#[command(name = "screenshots", about = "On-device screenshot testing")]
#[command(version, long_about = None)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = logging::init_cli(cli.verbose);

    let json = cli.command.json();
    let code = match cli::dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "error": { "code": e.code(), "message": e.to_string() } })
                );
            }
            eprintln!("Error: {e}");
            if e.is_configuration() {
                2
            } else {
                1
            }
        }
    };

    // Flush the file logger before exiting
    drop(_log_guard);
    std::process::exit(code);
}
