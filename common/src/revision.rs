use anyhow::Context;
use std::path::{Path, PathBuf};

use crate::Error;

/// Name of the marker file written at the root of every release.
pub const REVISION_FILE: &str = "REVISION";

pub fn revision_file_path(destination: &Path) -> PathBuf {
    destination.join(REVISION_FILE)
}

/// Record the deployed revision as `<revision>\n`.
pub async fn create_revision_file(destination: &Path, revision: &str) -> Result<(), Error> {
    let path = revision_file_path(destination);
    tracing::debug!("writing revision {:?} to {:?}", revision, &path);
    tokio::fs::write(&path, format!("{}\n", revision))
        .await
        .with_context(|| format!("failed writing {:?}", &path))
        .map_err(Error::Filesystem)
}

/// Read back a recorded revision, without the trailing newline.
pub async fn read_revision_file(destination: &Path) -> Result<String, Error> {
    let path = revision_file_path(destination);
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed reading {:?}", &path))
        .map_err(Error::Filesystem)?;
    Ok(content.trim_end_matches('\n').to_string())
}
