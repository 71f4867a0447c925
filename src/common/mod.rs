//! Common utilities shared by the CLI and the orchestration engine

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, InstallFailureKind, Result};

/// Read a file's contents, mapping the failure to a `FileRead` error
pub fn read_to_string(path: &std::path::Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })
}
