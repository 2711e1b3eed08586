//! Bench Harness - Hardware and toolchain collaborators for benchmark runs
//!
//! This crate wraps the tools a benchmark run drives but does not own:
//! the firmware build (CMake + make + `size`), the debug probe (through a
//! GDB/MI session against a GDB server) and the serial console.
//!
//! Each concern is a trait ([`BuildDriver`], [`TargetConnector`] /
//! [`TargetLifecycle`]) with one process-backed implementation, so the
//! measurement logic can be exercised without hardware.

pub mod firmware;
pub mod gdb;
pub mod serial;
pub mod target;

pub use firmware::{BuildDriver, BuildFlags, BuiltImage, CmakeBuild, ImageSize};
pub use gdb::{GdbConfig, GdbConnector, GdbTarget};
pub use serial::{open_serial, SerialConfig, SerialPort};
pub use target::{flash_to_entry, release_from_entry, TargetConnector, TargetLifecycle};

use std::time::Duration;

/// Errors raised by external tools
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A tool could not be started or talked to
    #[error("failed to run `{tool}`: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// A tool exited unsuccessfully
    #[error("`{tool}` exited with {status}")]
    ToolFailed { tool: String, status: String },

    /// Filesystem access around the build directory failed
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// GDB rejected a command
    #[error("gdb command `{command}` failed: {message}")]
    Gdb { command: String, message: String },

    /// GDB closed its output before answering
    #[error("gdb exited while running `{command}`")]
    GdbExited { command: String },

    /// A command did not answer in time
    #[error("`{command}` did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The `size` tool printed something unexpected
    #[error("cannot parse size output: {0:?}")]
    SizeOutput(String),
}

impl HarnessError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HarnessError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
