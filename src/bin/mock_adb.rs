//! Mock adb binary for integration testing
//!
//! Serves devices from a fixture tree instead of real hardware:
//!
//! ```text
//! $MOCK_ADB_ROOT/
//!   calls.log                    every invocation, one per line
//!   devices/<serial>/
//!     state                      optional, defaults to "device"
//!     install_error              optional, install prints it and fails
//!     capture/<name>.png         what the test process "captures"
//!     fs/                        the device filesystem
//! ```
//!
//! `am instrument` copies `capture/` into the screenshot directory of the
//! instrumented package and writes its `metadata.json`.

use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;

const EXTERNAL_STORAGE: &str = "/sdcard";

fn main() {
    let root = match std::env::var_os("MOCK_ADB_ROOT") {
        Some(root) => PathBuf::from(root),
        None => fail("MOCK_ADB_ROOT is not set"),
    };
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    log_call(&root, &args);

    let serial = if args.first().map(String::as_str) == Some("-s") && args.len() > 1 {
        let serial = args[1].clone();
        args.drain(..2);
        Some(serial)
    } else {
        None
    };

    let Some(command) = args.first().cloned() else {
        fail("no command");
    };

    if command == "devices" {
        println!("List of devices attached");
        for serial in serials(&root) {
            println!("{}\t{}", serial, state(&root, &serial));
        }
        println!();
        return;
    }

    let device = select_device(&root, serial);
    let rest = &args[1..];

    match command.as_str() {
        "get-state" => println!("{}", state(&root, &device)),
        "install" => install(&root, &device),
        "pull" => match rest {
            [remote, local] => pull(&root, &device, remote, local),
            _ => fail("usage: pull <remote> <local>"),
        },
        "shell" => shell(&root, &device, &rest.join(" ")),
        other => fail(&format!("unknown command '{}'", other)),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("error: {}", message);
    exit(1);
}

fn log_call(root: &Path, args: &[String]) {
    if let Ok(mut log) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join("calls.log"))
    {
        let _ = writeln!(log, "{}", args.join(" "));
    }
}

fn serials(root: &Path) -> Vec<String> {
    let mut serials: Vec<String> = fs::read_dir(root.join("devices"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    serials.sort();
    serials
}

fn device_dir(root: &Path, serial: &str) -> PathBuf {
    root.join("devices").join(serial)
}

fn state(root: &Path, serial: &str) -> String {
    fs::read_to_string(device_dir(root, serial).join("state"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "device".to_string())
}

fn select_device(root: &Path, serial: Option<String>) -> String {
    let available = serials(root);
    match serial {
        Some(serial) if available.contains(&serial) => {
            if state(root, &serial) != "device" {
                fail("device offline");
            }
            serial
        }
        Some(serial) => fail(&format!("device '{}' not found", serial)),
        None => match available.as_slice() {
            [only] => only.clone(),
            [] => fail("no devices/emulators found"),
            _ => fail("more than one device/emulator"),
        },
    }
}

/// Map an on-device path into the fixture filesystem
fn device_path(root: &Path, serial: &str, remote: &str) -> PathBuf {
    device_dir(root, serial)
        .join("fs")
        .join(remote.trim_start_matches('/'))
}

fn install(root: &Path, serial: &str) {
    match fs::read_to_string(device_dir(root, serial).join("install_error")) {
        Ok(error) => {
            println!("Performing Streamed Install");
            eprintln!("adb: failed to install: Failure [{}]", error.trim());
            exit(1);
        }
        Err(_) => {
            println!("Performing Streamed Install");
            println!("Success");
        }
    }
}

fn pull(root: &Path, serial: &str, remote: &str, local: &str) {
    let source = device_path(root, serial, remote);
    if !source.is_file() {
        fail(&format!("remote object '{}' does not exist", remote));
    }
    if let Err(e) = fs::copy(&source, local) {
        fail(&format!("cannot create '{}': {}", local, e));
    }
    println!("{}: 1 file pulled", remote);
}

fn shell(root: &Path, serial: &str, command: &str) {
    let words: Vec<&str> = command.split_whitespace().collect();
    match words.as_slice() {
        ["echo", "$EXTERNAL_STORAGE"] => println!("{}", EXTERNAL_STORAGE),
        ["test", "-e", path, "&&", "echo", "EXISTS"] => {
            if device_path(root, serial, path).exists() {
                println!("EXISTS");
            }
        }
        ["rm", "-rf", path] => {
            let target = device_path(root, serial, path);
            if target.is_dir() {
                let _ = fs::remove_dir_all(&target);
            } else {
                let _ = fs::remove_file(&target);
            }
        }
        ["getprop", prop] => println!("{}", getprop(prop)),
        ["wm", "density"] => println!("Physical density: 420"),
        ["wm", "size"] => println!("Physical size: 1080x1920"),
        ["pm", "path", "com.google.android.gms"] => {
            println!("package:/system/priv-app/GmsCore/GmsCore.apk")
        }
        ["am", "instrument", flags @ .., component] => instrument(root, serial, flags, component),
        _ => {
            eprintln!("/system/bin/sh: {}: not found", command);
            exit(127);
        }
    }
}

fn getprop(prop: &str) -> &'static str {
    match prop {
        "ro.build.version.sdk" => "30",
        "ro.product.cpu.abi" => "x86_64",
        "persist.sys.locale" => "en-US",
        _ => "",
    }
}

fn instrument(root: &Path, serial: &str, flags: &[&str], component: &str) {
    let test_run_id = flags
        .windows(3)
        .find(|w| w[0] == "-e" && w[1] == "testRunId")
        .map(|w| w[2].to_string())
        .unwrap_or_default();
    let package = component.split('/').next().unwrap_or(component);

    let out_dir = device_path(
        root,
        serial,
        &format!("{}/screenshots/{}/screenshots-default", EXTERNAL_STORAGE, package),
    );
    if let Err(e) = fs::create_dir_all(&out_dir) {
        fail(&e.to_string());
    }

    let mut captures: Vec<PathBuf> = fs::read_dir(device_dir(root, serial).join("capture"))
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    captures.sort();

    let mut screenshots = Vec::new();
    for capture in &captures {
        let Some(file) = capture.file_name().map(|f| f.to_string_lossy().into_owned()) else {
            continue;
        };
        let name = file.trim_end_matches(".png").to_string();
        if fs::copy(capture, out_dir.join(&file)).is_err() {
            continue;
        }
        println!("INSTRUMENTATION_STATUS: test={}", name);
        println!("INSTRUMENTATION_STATUS_CODE: 1");
        println!("INSTRUMENTATION_STATUS_CODE: 0");
        screenshots.push(json!({ "name": name, "files": [file] }));
    }

    let manifest = json!({ "test_run_id": test_run_id, "screenshots": screenshots });
    if let Err(e) = fs::write(out_dir.join("metadata.json"), manifest.to_string()) {
        fail(&e.to_string());
    }

    println!("INSTRUMENTATION_RESULT: stream=");
    println!("OK ({} tests)", captures.len());
    println!("INSTRUMENTATION_CODE: -1");
}
