//! Stage a source revision locally, package it and unpack it on a remote host
//!
//! A release goes through these steps, in order:
//!
//! 1. checkout: the revision is materialized either straight into the staging directory, or into
//!    a persistent copy cache which is then reproduced in the staging directory with hard links
//! 2. build: the optional `build_script` runs inside the staging directory
//! 3. exclusion sweep: paths matching `rsync_exclude` are deleted
//! 4. the `REVISION` file is written
//! 5. the staging directory is compressed into a single archive
//! 6. a server is selected, the archive is uploaded and unpacked into `releases_path` with one
//!    remote command
//!
//! The local archive and staging directory are removed when [`Strategy::deploy`] returns, no matter
//! which step failed.
//!
//! # Exclusion patterns
//!
//! Patterns are matched differently by the copy-cache walk and by the exclusion sweep. The walk
//! tests both the path relative to the cache root and the entry name, and `*` matches `/`. The
//! sweep tests the path relative to the staging root and `*` stops at `/`. A pattern such as
//! `.git/*` therefore behaves the same at the top level but not for nested directories; see
//! [`common::exclude`].

use anyhow::Context;
use common::Error;
use common::rollback::RollbackGuard;
use remote::select::{ServerSelector, ServerSpec};
use remote::transport::{Connection, Transport};
use std::path::Path;
use tracing::instrument;

pub mod scm;
pub mod settings;

use scm::Scm;
use settings::{CheckoutStrategy, Settings};

/// Outcome of the local part of a release.
#[derive(Copy, Clone, Debug, Default)]
pub struct PrepareSummary {
    /// `None` when the checkout went straight into the staging directory
    pub staged: Option<common::stage::Summary>,
    pub swept: common::sweep::Summary,
}

#[derive(Clone, Debug)]
pub struct Summary {
    pub revision: String,
    pub release_path: String,
    pub server: String,
    pub prepare: PrepareSummary,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "revision: {}", self.revision)?;
        writeln!(f, "release: {}", self.release_path)?;
        writeln!(f, "server: {}", self.server)?;
        if let Some(staged) = &self.prepare.staged {
            write!(f, "{}", staged)?;
        }
        write!(f, "{}", self.prepare.swept)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CheckSummary {
    pub found: Vec<String>,
    pub missing: Vec<String>,
}

impl CheckSummary {
    fn record(&mut self, what: String, found: bool) {
        if found {
            self.found.push(what);
        } else {
            self.missing.push(what);
        }
    }
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty()
    }
}

impl std::fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for what in &self.found {
            writeln!(f, "found: {}", what)?;
        }
        for what in &self.missing {
            writeln!(f, "missing: {}", what)?;
        }
        Ok(())
    }
}

pub struct Strategy {
    settings: Settings,
    scm: Box<dyn Scm>,
}

impl Strategy {
    pub fn new(settings: Settings) -> Result<Self, Error> {
        let scm = scm::scm(
            settings.scm,
            settings.repository.as_deref(),
            settings.scm_password.as_deref(),
        )?;
        Ok(Self { settings, scm })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The revision to deploy: `requested` if given, otherwise the configured one.
    pub fn revision(&self, requested: Option<&str>) -> Result<String, Error> {
        requested
            .or(self.settings.revision.as_deref())
            .map(str::to_string)
            .ok_or_else(|| Error::Config("no revision given".to_string()))
    }

    fn checkout_command(&self, revision: &str, destination: &Path) -> String {
        match self.settings.checkout_strategy {
            CheckoutStrategy::Checkout => self.scm.checkout(revision, destination),
            CheckoutStrategy::Export => self.scm.export(revision, destination),
        }
    }

    async fn create_dir(path: &Path) -> Result<(), Error> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("cannot create directory {:?}", path))
            .map_err(Error::Filesystem)
    }

    async fn refresh_cache(&self, revision: &str, cache: &Path) -> Result<(), Error> {
        let exists = tokio::fs::try_exists(cache)
            .await
            .with_context(|| format!("cannot access copy cache {:?}", cache))
            .map_err(Error::Filesystem)?;
        let command = if exists {
            tracing::info!("updating copy cache {:?} to revision {}", cache, revision);
            self.scm.sync(revision, cache)
        } else {
            if let Some(parent) = cache.parent() {
                Self::create_dir(parent).await?;
            }
            tracing::info!(
                "creating copy cache {:?} (via {:?}) at revision {}",
                cache,
                self.settings.checkout_strategy,
                revision
            );
            self.checkout_command(revision, cache)
        };
        common::command::run_shell(&command, None).await
    }

    /// Produce the staging directory: checkout, build, exclusion sweep and `REVISION`.
    ///
    /// Nothing is cleaned up here; [`Strategy::deploy`] owns the rollback.
    #[instrument(skip(self))]
    pub async fn prepare(&self, revision: &str) -> Result<PrepareSummary, Error> {
        let destination = &self.settings.destination;
        Self::create_dir(&self.settings.copy_dir).await?;
        let staged = match &self.settings.copy_cache {
            Some(cache) => {
                self.refresh_cache(revision, cache).await?;
                let stage_settings = common::stage::Settings {
                    exclude: self.settings.exclude.clone(),
                    max_open_files: self.settings.max_open_files,
                };
                let summary = common::stage::stage(cache, destination, &stage_settings)
                    .await
                    .map_err(|error| {
                        tracing::info!("staging stopped after:\n{}", &error.summary);
                        Error::from(error)
                    })?;
                tracing::info!("staged {:?}:\n{}", destination, &summary);
                Some(summary)
            }
            None => {
                tracing::info!(
                    "getting (via {:?}) revision {} to {:?}",
                    self.settings.checkout_strategy,
                    revision,
                    destination
                );
                common::command::run_shell(&self.checkout_command(revision, destination), None)
                    .await?;
                None
            }
        };
        common::build_script::build(destination, self.settings.build_script.as_deref()).await?;
        let swept =
            common::sweep::remove_excluded_files(destination, &self.settings.exclude).await?;
        common::revision::create_revision_file(destination, revision).await?;
        Ok(PrepareSummary { staged, swept })
    }

    /// Compress the staging directory into the local archive.
    pub async fn package(&self) -> Result<(), Error> {
        common::compression::package(
            &self.settings.compression,
            &self.settings.destination,
            &self.settings.archive,
        )
        .await
    }

    /// Upload the archive to a selected server and unpack it into `releases_path`.
    #[instrument(skip(self, selector))]
    pub async fn distribute(&self, selector: &dyn ServerSelector) -> Result<String, Error> {
        let server = self.select(selector)?;
        let connection = Connection::open(self.settings.transport, &server.session).await?;
        let mut handler = self.scm.handler();
        remote::transport::upload_and_unpack(
            &connection,
            &self.settings.archive,
            &self.settings.copy_remote_dir,
            &self.settings.releases_path,
            &self.settings.compression,
            handler.as_mut(),
        )
        .await?;
        Ok(server.session.to_string())
    }

    fn select(&self, selector: &dyn ServerSelector) -> Result<&ServerSpec, Error> {
        let server = selector.select(&self.settings.servers).ok_or_else(|| {
            Error::Config("no server with a non-zero weight to deploy to".to_string())
        })?;
        tracing::info!("selected server {}", &server.session);
        Ok(server)
    }

    /// Run a full release of `revision`.
    #[instrument(skip(self, selector))]
    pub async fn deploy(
        &self,
        revision: &str,
        selector: &dyn ServerSelector,
    ) -> Result<Summary, Error> {
        let _rollback = RollbackGuard::new(
            self.settings.archive.clone(),
            self.settings.destination.clone(),
        );
        let prepare = self.prepare(revision).await?;
        self.package().await?;
        let server = self.distribute(selector).await?;
        Ok(Summary {
            revision: revision.to_string(),
            release_path: self.settings.release_path.clone(),
            server,
            prepare,
        })
    }

    /// Verify the local and remote binaries a release needs are installed.
    #[instrument(skip(self))]
    pub async fn check(&self) -> Result<CheckSummary, Error> {
        let mut summary = CheckSummary::default();
        for program in [
            self.scm.local_command(),
            self.settings.compression.compress_program(),
        ] {
            let found = common::command::has_local_command(program).await;
            summary.record(format!("local: {}", program), found);
        }
        let program = self.settings.compression.decompress_program();
        for server in &self.settings.servers {
            let connection = Connection::open(self.settings.transport, &server.session).await?;
            let found = connection.has_command(program).await?;
            summary.record(format!("{}: {}", connection.host(), program), found);
        }
        Ok(summary)
    }
}
