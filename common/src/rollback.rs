//! Best-effort removal of the local archive and staging directory
//!
//! This is the only place that tears down local temporaries. [`RollbackGuard`] runs it once
//! when the pipeline scope ends, whether the pipeline succeeded, failed or panicked.

use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub archive_removed: bool,
    pub staging_removed: bool,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "archive removed: {}\nstaging directory removed: {}\n",
            self.archive_removed, self.staging_removed
        )
    }
}

fn ignore_not_found(result: std::io::Result<()>, path: &Path) -> bool {
    match result {
        Ok(()) => true,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => false,
        Err(error) => {
            tracing::warn!("rollback: failed removing {:?}: {}", path, error);
            false
        }
    }
}

/// Remove `archive` and the `staging` tree. Missing paths are fine; other failures are logged
/// and swallowed.
pub fn rollback_changes(archive: &Path, staging: &Path) -> Summary {
    tracing::debug!("rollback: removing {:?} and {:?}", archive, staging);
    let archive_removed = ignore_not_found(std::fs::remove_file(archive), archive);
    let staging_removed = match std::fs::symlink_metadata(staging) {
        Ok(md) if md.is_dir() => ignore_not_found(std::fs::remove_dir_all(staging), staging),
        Ok(_) => ignore_not_found(std::fs::remove_file(staging), staging),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => false,
        Err(error) => {
            tracing::warn!("rollback: failed reading metadata of {:?}: {}", staging, error);
            false
        }
    };
    Summary {
        archive_removed,
        staging_removed,
    }
}

/// Runs [`rollback_changes`] exactly once, when dropped.
#[derive(Debug)]
pub struct RollbackGuard {
    archive: PathBuf,
    staging: PathBuf,
}

impl RollbackGuard {
    #[must_use]
    pub fn new(archive: PathBuf, staging: PathBuf) -> Self {
        Self { archive, staging }
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let summary = rollback_changes(&self.archive, &self.staging);
        tracing::info!("rollback done:\n{}", summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_rollback_removes_both() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let archive = tmp_dir.path().join("release.tar.gz");
        let staging = tmp_dir.path().join("release");
        std::fs::write(&archive, "data")?;
        std::fs::create_dir_all(staging.join("nested").join("deeper"))?;
        std::fs::write(staging.join("nested").join("file"), "x")?;
        std::os::unix::fs::symlink("/nonexistent", staging.join("dangling"))?;
        let summary = rollback_changes(&archive, &staging);
        assert!(summary.archive_removed);
        assert!(summary.staging_removed);
        assert!(!archive.exists());
        assert!(!staging.exists());
        Ok(())
    }

    #[test]
    #[traced_test]
    fn test_rollback_missing_paths_is_fine() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let summary = rollback_changes(
            &tmp_dir.path().join("missing.tar.gz"),
            &tmp_dir.path().join("missing"),
        );
        assert_eq!(summary, Summary::default());
    }

    #[test]
    #[traced_test]
    fn test_rollback_does_not_follow_staging_symlink() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let real = tmp_dir.path().join("real");
        std::fs::create_dir(&real)?;
        std::fs::write(real.join("keep"), "x")?;
        let staging = tmp_dir.path().join("staging");
        std::os::unix::fs::symlink(&real, &staging)?;
        rollback_changes(&tmp_dir.path().join("none"), &staging);
        assert!(!staging.exists());
        assert!(real.join("keep").exists());
        Ok(())
    }

    #[test]
    #[traced_test]
    fn test_guard_runs_on_drop() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let archive = tmp_dir.path().join("a.zip");
        let staging = tmp_dir.path().join("a");
        std::fs::write(&archive, "zip")?;
        std::fs::create_dir(&staging)?;
        {
            let _guard = RollbackGuard::new(archive.clone(), staging.clone());
            assert!(archive.exists());
        }
        assert!(!archive.exists());
        assert!(!staging.exists());
        Ok(())
    }

    #[test]
    #[traced_test]
    fn test_guard_runs_on_early_error() {
        fn failing_step(archive: PathBuf, staging: PathBuf) -> Result<(), String> {
            let _guard = RollbackGuard::new(archive.clone(), staging.clone());
            std::fs::write(&archive, "partial").map_err(|e| e.to_string())?;
            Err("compression failed".to_string())
        }
        let tmp_dir = tempfile::tempdir().unwrap();
        let archive = tmp_dir.path().join("r.tar.gz");
        let staging = tmp_dir.path().join("r");
        assert!(failing_step(archive.clone(), staging.clone()).is_err());
        assert!(!archive.exists());
        assert!(!staging.exists());
    }
}
