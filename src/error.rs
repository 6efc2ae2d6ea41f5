//! Error taxonomy for the disk build pipeline.
//!
//! Every synchronous stage is fail-fast: the first error aborts the run.
//! Callers above the library (pipeline, CLI) wrap these in `anyhow` with
//! context describing the stage that failed.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the disk build stages.
#[derive(Debug, Error)]
pub enum BuildError {
    /// An external tool exited non-zero or was killed.
    #[error("command '{command}' failed: {}", describe_exit(*exited_normally, *exit_status))]
    ProcessExecutionFailure {
        command: String,
        exited_normally: bool,
        exit_status: i32,
    },

    /// The scripted guestfish session returned an unexpected response.
    #[error("guestfish returned unexpected output lines ({actual}, expected {expected})")]
    ToolProtocolError { expected: usize, actual: usize },

    /// A guestfish response line could not be parsed.
    #[error("guestfish returned unparseable line '{line}'")]
    ToolResponse { line: String },

    /// An expected kernel, initramfs, binary or config file is absent.
    #[error("couldn't find {what} at {}", path.display())]
    ResourceNotFound { what: String, path: PathBuf },

    /// Partition sizing is infeasible for the disk.
    #[error("invalid partition layout: {0}")]
    Layout(String),

    /// Another session or mount holds the disk image.
    #[error("disk image is in use by another session: {}", .0.display())]
    Locked(PathBuf),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

fn describe_exit(exited_normally: bool, exit_status: i32) -> String {
    if exited_normally {
        format!("exited with code {}", exit_status)
    } else {
        format!("terminated by signal {}", exit_status)
    }
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

impl BuildError {
    pub(crate) fn not_found(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        BuildError::ResourceNotFound {
            what: what.into(),
            path: path.into(),
        }
    }
}
