//! Release configuration
//!
//! Values come from an optional JSON file and `--set key=value` overrides, and are resolved once
//! into an immutable [`Settings`] snapshot. Every default and derived path is computed during
//! resolution, so nothing downstream reads configuration lazily.
//!
//! Example configuration file:
//! ```json
//! {
//!   "repository": "git@example.com:app.git",
//!   "deploy_to": "/u/apps/app",
//!   "rsync_exclude": [".git/*", "*.log"],
//!   "rsync_server": ["deploy@web1", "deploy@web2:2222=2"],
//!   "copy_compression": "bzip2",
//!   "copy_cache": "/var/cache/app"
//! }
//! ```

use anyhow::Context;
use common::Error;
use common::compression::{Compression, CompressionType};
use common::exclude::ExcludeSettings;
use remote::select::{SelectionStrategy, ServerSpec};
use remote::transport::TransportKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::scm::ScmKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckoutStrategy {
    #[default]
    Checkout,
    Export,
}

impl std::str::FromStr for CheckoutStrategy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches(':').to_ascii_lowercase().as_str() {
            "checkout" => Ok(CheckoutStrategy::Checkout),
            "export" => Ok(CheckoutStrategy::Export),
            _ => Err(Error::Config(format!(
                "invalid checkout strategy {:?}, expected checkout or export",
                s
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Configuration as written by the operator, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub repository: Option<String>,
    pub scm: Option<String>,
    /// answered to password prompts of the SCM
    pub scm_password: Option<String>,
    pub revision: Option<String>,
    pub build_script: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub rsync_exclude: Vec<String>,
    pub checkout_strategy: Option<String>,
    pub copy_dir: Option<PathBuf>,
    pub copy_cache: Option<PathBuf>,
    pub copy_remote_dir: Option<String>,
    pub copy_compression: Option<String>,
    pub copy_local_tar: Option<String>,
    pub copy_remote_tar: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub rsync_server: Vec<String>,
    pub server_selection: Option<String>,
    pub transport: Option<String>,
    pub deploy_to: Option<String>,
    pub releases_path: Option<String>,
    pub release_name: Option<String>,
    pub release_path: Option<String>,
}

/// Split `key=value`; used as a clap value parser for `--set`.
pub fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

impl RawConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading configuration file {:?}", path))
            .map_err(Error::Filesystem)?;
        Self::from_json(&content)
            .map_err(|error| Error::Config(format!("{}: {}", path.display(), error)))
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Apply one override. List keys (`rsync_exclude`, `rsync_server`) append to the list.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let value = value.to_string();
        let slot = match key {
            "repository" => &mut self.repository,
            "scm" => &mut self.scm,
            "scm_password" => &mut self.scm_password,
            "revision" => &mut self.revision,
            "build_script" => &mut self.build_script,
            "checkout_strategy" => &mut self.checkout_strategy,
            "copy_remote_dir" => &mut self.copy_remote_dir,
            "copy_compression" => &mut self.copy_compression,
            "copy_local_tar" => &mut self.copy_local_tar,
            "copy_remote_tar" => &mut self.copy_remote_tar,
            "server_selection" => &mut self.server_selection,
            "transport" => &mut self.transport,
            "deploy_to" => &mut self.deploy_to,
            "releases_path" => &mut self.releases_path,
            "release_name" => &mut self.release_name,
            "release_path" => &mut self.release_path,
            "copy_dir" => {
                self.copy_dir = Some(PathBuf::from(value));
                return Ok(());
            }
            "copy_cache" => {
                self.copy_cache = Some(PathBuf::from(value));
                return Ok(());
            }
            "rsync_exclude" => {
                self.rsync_exclude.push(value);
                return Ok(());
            }
            "rsync_server" => {
                self.rsync_server.push(value);
                return Ok(());
            }
            _ => return Err(Error::Config(format!("unknown configuration key {:?}", key))),
        };
        *slot = Some(value);
        Ok(())
    }
}

/// Resolved, validated configuration of one release.
#[derive(Debug, Clone)]
pub struct Settings {
    pub repository: Option<String>,
    pub scm: ScmKind,
    pub scm_password: Option<String>,
    pub revision: Option<String>,
    pub build_script: Option<String>,
    pub exclude: ExcludeSettings,
    pub checkout_strategy: CheckoutStrategy,
    pub copy_dir: PathBuf,
    pub copy_cache: Option<PathBuf>,
    pub copy_remote_dir: String,
    pub compression_type: CompressionType,
    pub compression: Compression,
    pub servers: Vec<ServerSpec>,
    pub server_selection: SelectionStrategy,
    pub transport: TransportKind,
    pub releases_path: String,
    pub release_path: String,
    /// local staging directory, `<copy_dir>/<basename(release_path)>`
    pub destination: PathBuf,
    /// local archive, `<copy_dir>/<basename(destination)>.<extension>`
    pub archive: PathBuf,
    /// directories read at once while staging from the copy cache, see
    /// [`common::stage::Settings::max_open_files`]
    pub max_open_files: Option<usize>,
}

fn parse_or_default<T>(value: Option<&str>) -> Result<T, Error>
where
    T: std::str::FromStr<Err = Error> + Default,
{
    value.map(str::parse).transpose().map(Option::unwrap_or_default)
}

fn absolute(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

impl Settings {
    pub fn resolve(raw: RawConfig) -> Result<Self, Error> {
        let cwd = std::env::current_dir()
            .context("cannot determine current directory")
            .map_err(Error::Filesystem)?;
        Self::resolve_with(raw, &cwd, chrono::Utc::now())
    }

    /// Resolve against an explicit working directory and clock.
    pub fn resolve_with(
        raw: RawConfig,
        cwd: &Path,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Self, Error> {
        // compression is validated before anything else so a typo never gets to run commands
        let compression_type: CompressionType = parse_or_default(raw.copy_compression.as_deref())?;
        let compression = Compression::new(
            compression_type,
            raw.copy_local_tar.as_deref().unwrap_or("tar"),
            raw.copy_remote_tar.as_deref().unwrap_or("tar"),
        );
        let exclude = ExcludeSettings::from_patterns(&raw.rsync_exclude)
            .map_err(|error| Error::Config(format!("rsync_exclude: {:#}", error)))?;
        let servers = if raw.rsync_server.is_empty() {
            vec![ServerSpec::parse("localhost")?]
        } else {
            raw.rsync_server
                .iter()
                .map(String::as_str)
                .map(ServerSpec::parse)
                .collect::<Result<Vec<_>, _>>()?
        };
        let releases_path = match (raw.releases_path, raw.deploy_to.as_deref()) {
            (Some(releases_path), _) => releases_path,
            (None, Some(deploy_to)) => format!("{}/releases", deploy_to.trim_end_matches('/')),
            (None, None) => {
                return Err(Error::Config(
                    "either deploy_to or releases_path must be set".to_string(),
                ));
            }
        };
        let release_path = match raw.release_path {
            Some(release_path) => release_path,
            None => {
                let release_name = raw
                    .release_name
                    .unwrap_or_else(|| now.format("%Y%m%d%H%M%S").to_string());
                format!("{}/{}", releases_path.trim_end_matches('/'), release_name)
            }
        };
        let release_basename = Path::new(&release_path)
            .file_name()
            .ok_or_else(|| {
                Error::Config(format!("release path {:?} has no basename", &release_path))
            })?
            .to_os_string();
        let copy_dir = absolute(
            &raw.copy_dir.unwrap_or_else(std::env::temp_dir),
            cwd,
        );
        let destination = copy_dir.join(release_basename);
        let archive = copy_dir.join(compression.archive_name(&destination)?);
        let copy_cache = raw.copy_cache.map(|cache| absolute(&cache, cwd));
        if let Some(cache) = &copy_cache {
            // the staging directory is removed after every release
            if destination.starts_with(cache) || cache.starts_with(&destination) {
                return Err(Error::Config(format!(
                    "staging directory {:?} overlaps copy_cache {:?}",
                    &destination, cache
                )));
            }
        }
        Ok(Self {
            repository: raw.repository,
            scm: parse_or_default(raw.scm.as_deref())?,
            scm_password: raw.scm_password,
            revision: raw.revision,
            build_script: raw.build_script,
            exclude,
            checkout_strategy: parse_or_default(raw.checkout_strategy.as_deref())?,
            copy_cache,
            copy_dir,
            copy_remote_dir: raw.copy_remote_dir.unwrap_or_else(|| "/tmp".to_string()),
            compression_type,
            compression,
            servers,
            server_selection: parse_or_default(raw.server_selection.as_deref())?,
            transport: parse_or_default(raw.transport.as_deref())?,
            releases_path,
            release_path,
            destination,
            archive,
            max_open_files: None,
        })
    }
}
