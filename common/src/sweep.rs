//! Post-hoc exclusion sweep over a checked out tree
//!
//! Used when the checkout lands directly in the staging directory (no copy-cache walk). Patterns
//! are resolved against the destination root with [`MatchContext::Sweep`] rules and every match
//! is removed recursively.

use anyhow::Context;
use async_recursion::async_recursion;
use std::path::Path;
use tracing::instrument;

use crate::Error;
use crate::exclude::{ExcludeResult, ExcludeSettings, MatchContext};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_removed: usize,
    pub symlinks_removed: usize,
    pub directories_removed: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_removed: self.files_removed + other.files_removed,
            symlinks_removed: self.symlinks_removed + other.symlinks_removed,
            directories_removed: self.directories_removed + other.directories_removed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files removed: {}\n\
            symlinks removed: {}\n\
            directories removed: {}\n",
            self.files_removed, self.symlinks_removed, self.directories_removed
        )
    }
}

/// Remove `path`, recursing into directories without following symlinks.
#[async_recursion]
async fn remove(path: &Path) -> Result<Summary, Error> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", path))
        .map_err(Error::Filesystem)?;
    if !metadata.is_dir() {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {:?}", path))
            .map_err(Error::Filesystem)?;
        return Ok(if metadata.file_type().is_symlink() {
            Summary {
                symlinks_removed: 1,
                ..Default::default()
            }
        } else {
            Summary {
                files_removed: 1,
                ..Default::default()
            }
        });
    }
    let mut summary = Summary {
        directories_removed: 1,
        ..Default::default()
    };
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", path))
        .map_err(Error::Filesystem)?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", path))
        .map_err(Error::Filesystem)?
    {
        summary = summary + remove(&entry.path()).await?;
    }
    tokio::fs::remove_dir(path)
        .await
        .with_context(|| format!("failed removing directory {:?}", path))
        .map_err(Error::Filesystem)?;
    Ok(summary)
}

#[async_recursion]
async fn sweep_dir(
    root: &Path,
    relative: &Path,
    exclude: &ExcludeSettings,
) -> Result<Summary, Error> {
    let dir = root.join(relative);
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", &dir))
        .map_err(Error::Filesystem)?;
    let mut summary = Summary::default();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &dir))
        .map_err(Error::Filesystem)?
    {
        let entry_relative = relative.join(entry.file_name());
        match exclude.check(&entry_relative, MatchContext::Sweep) {
            ExcludeResult::Included => {}
            // never reached through read_dir, but removing `..` would climb out of the root
            ExcludeResult::DotEntry => continue,
            ExcludeResult::ExcludedByPattern(pattern) => {
                tracing::debug!("removing {:?} (excluded by '{}')", &entry_relative, pattern);
                summary = summary + remove(&entry.path()).await?;
                continue;
            }
        }
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed reading file type of {:?}", entry.path()))
            .map_err(Error::Filesystem)?;
        if file_type.is_dir() {
            summary = summary + sweep_dir(root, &entry_relative, exclude).await?;
        }
    }
    Ok(summary)
}

/// Delete everything under `destination` matched by `exclude`.
#[instrument(skip(exclude))]
pub async fn remove_excluded_files(
    destination: &Path,
    exclude: &ExcludeSettings,
) -> Result<Summary, Error> {
    if exclude.is_empty() {
        return Ok(Summary::default());
    }
    tracing::info!("processing exclusions in {:?}", destination);
    sweep_dir(destination, Path::new(""), exclude).await
}
