//! Error kinds shared by every pipeline step
//!
//! All of them are fatal: the pipeline stops at the first one and the rollback guard cleans up
//! local temporaries before the error reaches the caller.
//!
//! # Logging Convention
//! Wrapped `anyhow` errors keep their context chain; log them with `{:#}`:
//! ```ignore
//! tracing::error!("deploy failed: {:#}", &error);
//! ```

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A local or remote subprocess exited unsuccessfully. `code` is `None` when the process was
    /// terminated by a signal.
    #[error("shell command failed with return code {code:?}: {command}")]
    CommandFailed { command: String, code: Option<i32> },

    /// Unrecognized compression type, raised while resolving configuration.
    #[error("invalid compression type {0:?}")]
    InvalidCompression(String),

    /// Any other invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Hard links can't span filesystems and we never fall back to copying data.
    #[error("cannot hard link {src:?} to {dst:?}: cache and staging directory are on different filesystems")]
    CrossDevice {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
    },

    #[error("{0:#}")]
    Filesystem(#[source] anyhow::Error),

    #[error("{0:#}")]
    Transport(#[source] anyhow::Error),
}

impl Error {
    /// Builds a `CommandFailed` from an explicitly returned exit status.
    #[must_use]
    pub fn command_failed(command: impl Into<String>, status: std::process::ExitStatus) -> Self {
        Error::CommandFailed {
            command: command.into(),
            code: status.code(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
