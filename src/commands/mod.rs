//! Command implementations behind the CLI. Each command returns the
//! process exit code; config and IO failures surface here, provider
//! outcomes never do (they live in reports).

pub mod cleanup;
pub mod config_cmd;
pub mod doctor;
pub mod groups;
pub mod init;
pub mod ls;
pub mod run;
pub mod status;

use std::path::PathBuf;

use crate::error::LibrariumError;

/// Print a fatal error and return the configuration/selection exit code.
pub(crate) fn fail(err: &LibrariumError) -> i32 {
    eprintln!("error: {err}");
    2
}

pub(crate) fn current_dir() -> Result<PathBuf, LibrariumError> {
    std::env::current_dir().map_err(LibrariumError::Io)
}
