//! Copy-cache staging: reproduce a cached checkout under the staging directory using hard links
//!
//! Regular files become hard links to the cache (same inode, same device), directories are
//! recreated and symlinks are recreated with their exact target string. The cache and the
//! staging directory must live on the same filesystem; there is no fallback to copying data.

use anyhow::Context;
use async_recursion::async_recursion;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

use crate::exclude::{ExcludeResult, ExcludeSettings, MatchContext};

/// Error type for staging that keeps the summary of what was done before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    #[source]
    pub source: crate::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: crate::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
    fn filesystem(source: anyhow::Error) -> Self {
        Self::new(crate::Error::Filesystem(source), Default::default())
    }
}

impl From<Error> for crate::Error {
    fn from(error: Error) -> Self {
        error.source
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub exclude: ExcludeSettings,
    /// Maximum number of directories read at the same time, 0 means no limit, None means 80% of
    /// the open files limit of the process
    pub max_open_files: Option<usize>,
}

/// 80% of the soft `RLIMIT_NOFILE`, or None if it is unlimited or cannot be read.
pub fn default_max_open_files() -> Option<usize> {
    use nix::sys::resource::{RLIM_INFINITY, Resource, getrlimit};
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE).ok()?;
    if soft == RLIM_INFINITY {
        return None;
    }
    let max_open_files = usize::try_from(soft / 5 * 4).ok()?;
    Some(max_open_files.max(1))
}

/// State shared by every task of one staging walk.
#[derive(Debug)]
struct Walk {
    exclude: ExcludeSettings,
    /// one permit per open directory handle
    open_dirs: Option<tokio::sync::Semaphore>,
}

impl Walk {
    fn new(settings: &Settings) -> Self {
        let limit = match settings.max_open_files {
            Some(0) => None,
            Some(limit) => Some(limit),
            None => default_max_open_files(),
        };
        tracing::debug!("reading at most {:?} directories at once", limit);
        Self {
            exclude: settings.exclude.clone(),
            open_dirs: limit.map(tokio::sync::Semaphore::new),
        }
    }

    async fn open_dir_permit(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        match &self.open_dirs {
            // the semaphore is never closed
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub hard_links_created: usize,
    pub symlinks_created: usize,
    pub directories_created: usize,
    pub entries_excluded: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            hard_links_created: self.hard_links_created + other.hard_links_created,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            directories_created: self.directories_created + other.directories_created,
            entries_excluded: self.entries_excluded + other.entries_excluded,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "hard-links created: {}\n\
            symlinks created: {}\n\
            directories created: {}\n\
            entries excluded: {}\n",
            self.hard_links_created,
            self.symlinks_created,
            self.directories_created,
            self.entries_excluded
        )
    }
}

/// Kind of a cache entry. Anything that is not a directory or a symlink is staged as a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    pub fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

/// Paths of one entry being staged.
#[derive(Debug)]
struct Entry {
    /// path relative to the cache root, matched against exclusions
    relative: PathBuf,
    src: PathBuf,
    dst: PathBuf,
}

fn is_cross_device(error: &std::io::Error) -> bool {
    error.raw_os_error() == Some(libc::EXDEV)
}

#[instrument]
async fn link_file(entry: &Entry) -> Result<Summary, Error> {
    if let Err(error) = tokio::fs::hard_link(&entry.src, &entry.dst).await {
        if is_cross_device(&error) {
            return Err(Error::new(
                crate::Error::CrossDevice {
                    src: entry.src.clone(),
                    dst: entry.dst.clone(),
                },
                Default::default(),
            ));
        }
        return Err(Error::filesystem(anyhow::Error::new(error).context(format!(
            "failed to hard link {:?} to {:?}",
            &entry.src, &entry.dst
        ))));
    }
    Ok(Summary {
        hard_links_created: 1,
        ..Default::default()
    })
}

#[instrument]
async fn copy_symlink(entry: &Entry) -> Result<Summary, Error> {
    let target = tokio::fs::read_link(&entry.src)
        .await
        .with_context(|| format!("failed reading symlink {:?}", &entry.src))
        .map_err(Error::filesystem)?;
    tokio::fs::symlink(&target, &entry.dst)
        .await
        .with_context(|| format!("failed creating symlink {:?} -> {:?}", &entry.dst, &target))
        .map_err(Error::filesystem)?;
    Ok(Summary {
        symlinks_created: 1,
        ..Default::default()
    })
}

#[instrument(skip(walk))]
async fn copy_directory(entry: &Entry, walk: &Arc<Walk>) -> Result<Summary, Error> {
    tokio::fs::create_dir(&entry.dst)
        .await
        .with_context(|| format!("cannot create directory {:?}", &entry.dst))
        .map_err(Error::filesystem)?;
    let summary = Summary {
        directories_created: 1,
        ..Default::default()
    };
    match copy_entries(&entry.src, &entry.dst, &entry.relative, walk).await {
        Ok(children) => Ok(summary + children),
        Err(error) => Err(Error::new(error.source, summary + error.summary)),
    }
}

#[async_recursion]
async fn process_entry(kind: EntryKind, entry: Entry, walk: Arc<Walk>) -> Result<Summary, Error> {
    match kind {
        EntryKind::File => link_file(&entry).await,
        EntryKind::Directory => copy_directory(&entry, &walk).await,
        EntryKind::Symlink => copy_symlink(&entry).await,
    }
}

/// Child results of one directory. The first failure is kept and stops the walk.
#[derive(Default)]
struct Children {
    summary: Summary,
    error: Option<Error>,
}

impl Children {
    fn record(
        &mut self,
        res: Result<Result<Summary, Error>, tokio::task::JoinError>,
        join_set: &mut tokio::task::JoinSet<Result<Summary, Error>>,
    ) {
        let error = match res {
            Ok(Ok(child_summary)) => {
                self.summary = self.summary + child_summary;
                return;
            }
            Ok(Err(error)) => {
                self.summary = self.summary + error.summary;
                Error::new(error.source, Default::default())
            }
            // aborted after a sibling failed
            Err(join_error) if join_error.is_cancelled() => return,
            Err(join_error) => Error::filesystem(
                anyhow::Error::new(join_error).context("staging task failed"),
            ),
        };
        if self.error.is_some() {
            tracing::debug!("additional staging error: {:#}", &error);
            return;
        }
        join_set.abort_all();
        self.error = Some(error);
    }

    fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Stage every entry of `src` into the already existing `dst`.
async fn copy_entries(
    src: &Path,
    dst: &Path,
    relative: &Path,
    walk: &Arc<Walk>,
) -> Result<Summary, Error> {
    let open_dir_permit = walk.open_dir_permit().await;
    let mut entries = tokio::fs::read_dir(src)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", src))
        .map_err(Error::filesystem)?;
    let mut join_set = tokio::task::JoinSet::new();
    let mut children = Children::default();
    loop {
        while let Some(res) = join_set.try_join_next() {
            children.record(res, &mut join_set);
        }
        if children.failed() {
            break;
        }
        let next = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", src));
        let dir_entry = match next {
            Ok(Some(dir_entry)) => dir_entry,
            Ok(None) => break,
            Err(error) => {
                join_set.abort_all();
                children.error = Some(Error::filesystem(error));
                break;
            }
        };
        let name = dir_entry.file_name();
        let entry_relative = relative.join(&name);
        match walk.exclude.check(&entry_relative, MatchContext::Walk) {
            ExcludeResult::Included => {}
            result => {
                tracing::debug!("skipping {:?}: {:?}", &entry_relative, result);
                children.summary.entries_excluded += 1;
                continue;
            }
        }
        let file_type = match dir_entry
            .file_type()
            .await
            .with_context(|| format!("failed reading file type of {:?}", dir_entry.path()))
        {
            Ok(file_type) => file_type,
            Err(error) => {
                join_set.abort_all();
                children.error = Some(Error::filesystem(error));
                break;
            }
        };
        let entry = Entry {
            relative: entry_relative,
            src: dir_entry.path(),
            dst: dst.join(&name),
        };
        join_set.spawn(process_entry(
            EntryKind::from_file_type(file_type),
            entry,
            walk.clone(),
        ));
    }
    // children wait for this permit, so release the handle before waiting on them
    drop(entries);
    drop(open_dir_permit);
    // drain the aborted tasks too before reporting
    while let Some(res) = join_set.join_next().await {
        children.record(res, &mut join_set);
    }
    match children.error {
        Some(error) => Err(Error::new(error.source, children.summary)),
        None => Ok(children.summary),
    }
}

/// Reproduce the `cache` tree under `destination`, hard-linking files.
///
/// `destination` is created if missing; any entry already present in it is an error.
#[instrument(skip(settings))]
pub async fn stage(cache: &Path, destination: &Path, settings: &Settings) -> Result<Summary, Error> {
    let cache_metadata = tokio::fs::metadata(cache)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", cache))
        .map_err(Error::filesystem)?;
    if !cache_metadata.is_dir() {
        return Err(Error::filesystem(anyhow::anyhow!(
            "copy cache {:?} is not a directory",
            cache
        )));
    }
    tokio::fs::create_dir_all(destination)
        .await
        .with_context(|| format!("cannot create staging directory {:?}", destination))
        .map_err(Error::filesystem)?;
    let destination_metadata = tokio::fs::metadata(destination)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", destination))
        .map_err(Error::filesystem)?;
    if cache_metadata.dev() != destination_metadata.dev() {
        return Err(Error::new(
            crate::Error::CrossDevice {
                src: cache.to_path_buf(),
                dst: destination.to_path_buf(),
            },
            Default::default(),
        ));
    }
    tracing::info!(
        "copying cache {:?} to deployment staging area {:?}",
        cache,
        destination
    );
    let walk = Arc::new(Walk::new(settings));
    let summary = copy_entries(cache, destination, Path::new(""), &walk).await?;
    tracing::debug!("staging done:\n{}", &summary);
    Ok(summary)
}
