//! Compression profiles used to package the staged release
//!
//! | type | extension | compress | decompress |
//! |---|---|---|---|
//! | `gzip` / `gz` (default) | `tar.gz` | `tar czf <archive> <dir>` | `tar xzf <archive>` |
//! | `bzip2` / `bz2` | `tar.bz2` | `tar cjf <archive> <dir>` | `tar xjf <archive>` |
//! | `zip` | `zip` | `zip -qyr <archive> <dir>` | `unzip -q <archive>` |
//!
//! Commands are argv lists; the first element is the utility performing the work.

use std::path::Path;
use tracing::instrument;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    Gzip,
    Bzip2,
    Zip,
}

impl std::str::FromStr for CompressionType {
    type Err = Error;
    /// Accepts `gzip`, `gz`, `bzip2`, `bz2` and `zip`, with an optional leading `:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().trim_start_matches(':').to_ascii_lowercase();
        match name.as_str() {
            "gzip" | "gz" => Ok(CompressionType::Gzip),
            "bzip2" | "bz2" => Ok(CompressionType::Bzip2),
            "zip" => Ok(CompressionType::Zip),
            _ => Err(Error::InvalidCompression(s.to_string())),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            CompressionType::Gzip => "gzip",
            CompressionType::Bzip2 => "bzip2",
            CompressionType::Zip => "zip",
        };
        write!(f, "{}", name)
    }
}

/// Archive extension plus the compress/decompress command prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compression {
    pub extension: String,
    pub compress_command: Vec<String>,
    pub decompress_command: Vec<String>,
}

impl Compression {
    /// `local_tar` and `remote_tar` replace the `tar` binary on each side; zip ignores them.
    pub fn new(compression_type: CompressionType, local_tar: &str, remote_tar: &str) -> Self {
        let argv = |program: &str, flags: &str| vec![program.to_string(), flags.to_string()];
        match compression_type {
            CompressionType::Gzip => Self {
                extension: "tar.gz".to_string(),
                compress_command: argv(local_tar, "czf"),
                decompress_command: argv(remote_tar, "xzf"),
            },
            CompressionType::Bzip2 => Self {
                extension: "tar.bz2".to_string(),
                compress_command: argv(local_tar, "cjf"),
                decompress_command: argv(remote_tar, "xjf"),
            },
            CompressionType::Zip => Self {
                extension: "zip".to_string(),
                compress_command: argv("zip", "-qyr"),
                decompress_command: argv("unzip", "-q"),
            },
        }
    }
    /// Command that compresses `directory` into `file`.
    pub fn compress(&self, directory: &str, file: &str) -> Vec<String> {
        let mut argv = self.compress_command.clone();
        argv.push(file.to_string());
        argv.push(directory.to_string());
        argv
    }
    /// Command that extracts `file` into the current directory, keeping its directory structure.
    pub fn decompress(&self, file: &str) -> Vec<String> {
        let mut argv = self.decompress_command.clone();
        argv.push(file.to_string());
        argv
    }
    /// Local binary needed by [`Compression::compress`].
    pub fn compress_program(&self) -> &str {
        &self.compress_command[0]
    }
    /// Remote binary needed by [`Compression::decompress`].
    pub fn decompress_program(&self) -> &str {
        &self.decompress_command[0]
    }
    /// `<basename(destination)>.<extension>`
    pub fn archive_name(&self, destination: &Path) -> Result<String, Error> {
        let base = file_name_str(destination)?;
        Ok(format!("{}.{}", base, self.extension))
    }
}

fn file_name_str(path: &Path) -> Result<&str, Error> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::Config(format!("{:?} has no usable basename", path)))
}

/// Package `destination` into `archive`.
///
/// The compress command runs from the parent of `destination` so the archive holds a single
/// top level directory named after the release.
#[instrument]
pub async fn package(
    compression: &Compression,
    destination: &Path,
    archive: &Path,
) -> Result<(), Error> {
    let parent = destination
        .parent()
        .ok_or_else(|| Error::Config(format!("{:?} has no parent directory", destination)))?;
    let directory = file_name_str(destination)?;
    let file = archive
        .to_str()
        .ok_or_else(|| Error::Config(format!("{:?} is not valid UTF-8", archive)))?;
    tracing::info!("compressing {:?} to {:?}", destination, archive);
    crate::command::run_argv(&compression.compress(directory, file), parent).await
}
