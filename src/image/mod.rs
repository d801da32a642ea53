//! Read access to a container image and the ability to commit a relabelled copy.

pub mod archive;
pub mod daemon;
mod rootfs;

#[cfg(test)]
pub mod fake;

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

/// Captured result of a command executed inside an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failures of the image access channel itself.
///
/// Missing files are not errors; `read_file` and `list_dir` report them as
/// `Ok(None)`.
#[derive(Debug, Error)]
pub enum AccessorError {
    /// The backend cannot offer this capability for this image (no runtime,
    /// tool missing inside the image).
    #[error("{capability} unavailable: {reason}")]
    Unavailable {
        capability: &'static str,
        reason: String,
    },

    /// The container CLI could not be spawned at all.
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The container CLI ran but reported a failure.
    #[error("'{command}' failed (exit code {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The image archive or its JSON documents are not what we expect.
    #[error("invalid image archive: {0}")]
    Archive(String),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl AccessorError {
    /// Whether this error only means a capability is absent, so callers may
    /// fall back or treat the requested artifact as missing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AccessorError::Unavailable { .. })
    }
}

/// Access to a container image's configuration and filesystem, regardless of
/// whether it lives in a container daemon or in a tarball.
pub trait Image {
    /// Labels from the image configuration (empty when the image has none).
    fn config_labels(&self) -> Result<HashMap<String, String>, AccessorError>;

    /// Read a file from the image filesystem. `Ok(None)` when absent.
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, AccessorError>;

    /// Names of the direct children of a directory, sorted. `Ok(None)` when
    /// the directory is absent.
    fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>, AccessorError>;

    /// Run `argv` inside the image and capture stdout.
    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, AccessorError>;

    /// Commit a new image carrying `key=value` as a label and return its
    /// digest (`sha256:<hex>`).
    fn commit_with_label(&self, key: &str, value: &str) -> Result<String, AccessorError>;
}
