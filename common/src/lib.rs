//! Core building blocks of the rstage release pipeline
//!
//! - [`exclude`]: glob based exclusion of paths
//! - [`stage`]: copy-cache staging with hard links
//! - [`sweep`]: post-hoc removal of excluded paths
//! - [`build_script`]: optional build step inside the staged tree
//! - [`revision`]: the `REVISION` marker file
//! - [`compression`]: compression profiles and packaging
//! - [`rollback`]: unconditional cleanup of local temporaries
//!
//! [`run`] sets up logging and the tokio runtime for the command line tools.

pub mod build_script;
pub mod command;
pub mod compression;
pub mod config;
pub mod error;
pub mod exclude;
pub mod revision;
pub mod rollback;
pub mod stage;
pub mod sweep;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig};
pub use error::{Error, Result};

/// Quote `s` for a POSIX shell. Plain words are left untouched.
pub fn shell_escape(s: &str) -> String {
    let is_safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if is_safe {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn init_logging(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_directive()));
    // a subscriber may already be installed (e.g. by tests); keep it
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run `func` on a fresh tokio runtime with logging configured.
///
/// Errors are logged (unless quiet) and `None` is returned so the caller can pick the exit code.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_logging(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                tracing::error!("failed to create tokio runtime: {}", &error);
            }
            return None;
        }
    };
    match tokio_runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
            }
            None
        }
    }
}
