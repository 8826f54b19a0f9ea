//! Uploading the archive and unpacking it on the target host
//!
//! Unpacking is a single remote command: change into the releases directory, extract the
//! uploaded archive and delete it. Either all of it runs or the command reports failure.

use anyhow::Context;
use sha2::Digest;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::SshSession;
use crate::handler::{ChannelState, DataHandler, Stream};
use crate::shell_escape;
use common::Error;

const CHUNK_SIZE: usize = 64 * 1024;

/// Remote-execution layer used by the release pipeline.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Host name used in logs and channel state.
    fn host(&self) -> String;
    /// Copy the local file to `remote_path`, replacing it atomically.
    async fn upload(&self, local: &Path, remote_path: &str) -> Result<(), Error>;
    /// Run a shell line remotely, feeding its output to `handler`.
    async fn run(&self, command: &str, handler: &mut dyn DataHandler) -> Result<(), Error>;
    /// Whether `program` is available on the remote `PATH`.
    async fn has_command(&self, program: &str) -> Result<bool, Error>;
}

/// `<remote_dir>/<basename(archive)>`
pub fn remote_filename(remote_dir: &str, archive: &Path) -> Result<String, Error> {
    let name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::Config(format!("{:?} has no usable basename", archive)))?;
    Ok(format!("{}/{}", remote_dir.trim_end_matches('/'), name))
}

/// `cd <releases_path> && <decompress...> && rm <remote_filename>`
pub fn unpack_command<S: AsRef<str>>(
    releases_path: &str,
    decompress: &[S],
    remote_filename: &str,
) -> String {
    let decompress = decompress
        .iter()
        .map(|arg| shell_escape(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "cd {} && {} && rm {}",
        shell_escape(releases_path),
        decompress,
        shell_escape(remote_filename)
    )
}

/// `mkdir -p <dir> && cat > <dir>/.<name>.tmp.$$ && mv -f <temp> <remote_path>`
///
/// The archive is read from stdin. `$$` (the remote shell PID) keeps the temporary name unique and
/// is the only unquoted part of the command.
pub fn upload_command(remote_path: &str) -> anyhow::Result<String> {
    let path = Path::new(remote_path);
    let dir = path
        .parent()
        .and_then(|dir| dir.to_str())
        .context("remote path must have a parent directory")?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("remote path must have a filename")?;
    let temp_path = format!(
        "{}/{}.tmp.$$",
        shell_escape(dir),
        shell_escape(&format!(".{}", filename))
    );
    Ok(format!(
        "mkdir -p {dir} && cat > {temp} && mv -f {temp} {dst}",
        dir = shell_escape(dir),
        temp = temp_path,
        dst = shell_escape(remote_path),
    ))
}

/// Upload `archive` to `<remote_dir>` and unpack it into `releases_path`.
///
/// Returns the remote path the archive was uploaded to.
pub async fn upload_and_unpack<T: Transport>(
    transport: &T,
    archive: &Path,
    remote_dir: &str,
    releases_path: &str,
    compression: &common::compression::Compression,
    handler: &mut dyn DataHandler,
) -> Result<String, Error> {
    let remote_path = remote_filename(remote_dir, archive)?;
    tracing::info!(
        "uploading {:?} to {}:{}",
        archive,
        transport.host(),
        &remote_path
    );
    transport.upload(archive, &remote_path).await?;
    let command = unpack_command(
        releases_path,
        &compression.decompress(&remote_path),
        &remote_path,
    );
    tracing::info!("unpacking on {}: {}", transport.host(), &command);
    transport.run(&command, handler).await?;
    Ok(remote_path)
}

/// Pump a running command's output through `handler`, writing its answers to stdin.
async fn drive_channel<W, O, E>(
    mut stdin: Option<W>,
    mut stdout: O,
    mut stderr: E,
    handler: &mut dyn DataHandler,
    state: &mut ChannelState,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut out_done = false;
    let mut err_done = false;
    while !(out_done && err_done) {
        let (stream, read) = tokio::select! {
            res = stdout.read(&mut out_buf), if !out_done => (Stream::Stdout, res),
            res = stderr.read(&mut err_buf), if !err_done => (Stream::Stderr, res),
        };
        let n = read.with_context(|| format!("failed reading {:?} of remote command", stream))?;
        let buf = match stream {
            Stream::Stdout => &out_buf,
            Stream::Stderr => &err_buf,
        };
        if n == 0 {
            match stream {
                Stream::Stdout => out_done = true,
                Stream::Stderr => err_done = true,
            }
            continue;
        }
        let text = String::from_utf8_lossy(&buf[..n]);
        tracing::debug!("[{}] {:?}: {}", state.host, stream, text.trim_end());
        let Some(response) = handler.handle_data(state, stream, &text) else {
            continue;
        };
        match stdin.as_mut() {
            Some(writer) => {
                writer
                    .write_all(response.as_bytes())
                    .await
                    .context("failed writing response to remote command")?;
                writer.flush().await.context("failed flushing remote stdin")?;
                state.responses_sent += 1;
            }
            None => tracing::warn!("[{}] stdin is closed, dropping response", state.host),
        }
    }
    Ok(())
}

/// Transport over an `openssh` master connection.
pub struct SshTransport {
    session: SshSession,
    connection: Arc<openssh::Session>,
}

impl SshTransport {
    pub async fn connect(session: &SshSession) -> Result<Self, Error> {
        let connection = crate::setup_ssh_session(session)
            .await
            .with_context(|| format!("cannot connect to {}", session))
            .map_err(Error::Transport)?;
        Ok(Self {
            session: session.clone(),
            connection,
        })
    }

    async fn stream_to_remote(&self, local: &Path, remote_path: &str) -> anyhow::Result<String> {
        let cmd = upload_command(remote_path)?;
        let mut child = self
            .connection
            .command("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::null())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .context("failed to spawn remote command for archive upload")?;
        let mut stdin = child
            .stdin()
            .take()
            .context("failed to get stdin for remote command")?;
        let mut stderr = child
            .stderr()
            .take()
            .context("failed to get stderr for remote command")?;
        let mut file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("cannot open {:?} for reading", local))?;
        let mut hasher = sha2::Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let stderr_fut = async {
            let mut data = Vec::new();
            let _ = stderr.read_to_end(&mut data).await;
            data
        };
        let send_fut = async {
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .with_context(|| format!("failed reading {:?}", local))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                stdin
                    .write_all(&buf[..n])
                    .await
                    .context("failed writing archive to remote stdin")?;
            }
            // close stdin so `cat` sees EOF
            stdin.shutdown().await.context("failed to shutdown stdin")?;
            drop(stdin);
            anyhow::Ok(())
        };
        let (send_res, stderr_data) = tokio::join!(send_fut, stderr_fut);
        let status = child
            .wait()
            .await
            .context("failed to wait for remote upload completion")?;
        if !status.success() {
            anyhow::bail!(
                "failed to upload archive to remote host\n\nstderr: {}",
                String::from_utf8_lossy(&stderr_data)
            );
        }
        send_res?;
        Ok(hex::encode(hasher.finalize()))
    }

    async fn verify_remote_checksum(&self, remote_path: &str, expected: &str) -> anyhow::Result<()> {
        let cmd = format!("sha256sum {}", shell_escape(remote_path));
        let output = self
            .connection
            .command("sh")
            .arg("-c")
            .arg(&cmd)
            .output()
            .await
            .context("failed to run sha256sum on remote host")?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to compute checksum on remote host\nstderr: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        // sha256sum output format: "checksum filename"
        let remote_checksum = stdout
            .split_whitespace()
            .next()
            .context("unexpected sha256sum output format")?;
        if remote_checksum != expected {
            anyhow::bail!(
                "checksum mismatch after upload\n\nExpected: {}\nGot:      {}",
                expected,
                remote_checksum
            );
        }
        Ok(())
    }
}

impl Transport for SshTransport {
    fn host(&self) -> String {
        self.session.to_string()
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> Result<(), Error> {
        let checksum = self
            .stream_to_remote(local, remote_path)
            .await
            .map_err(Error::Transport)?;
        tracing::debug!("uploaded {:?}, SHA-256 {}", local, &checksum);
        self.verify_remote_checksum(remote_path, &checksum)
            .await
            .map_err(Error::Transport)
    }

    async fn run(&self, command: &str, handler: &mut dyn DataHandler) -> Result<(), Error> {
        let mut child = self
            .connection
            .command("sh")
            .arg("-c")
            .arg(command)
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .with_context(|| format!("failed to spawn remote command on {}", self.session))
            .map_err(Error::Transport)?;
        let stdin = child.stdin().take();
        let stdout = child
            .stdout()
            .take()
            .context("failed to get stdout for remote command")
            .map_err(Error::Transport)?;
        let stderr = child
            .stderr()
            .take()
            .context("failed to get stderr for remote command")
            .map_err(Error::Transport)?;
        let mut state = ChannelState::new(self.host());
        drive_channel(stdin, stdout, stderr, handler, &mut state)
            .await
            .map_err(Error::Transport)?;
        let status = child
            .wait()
            .await
            .context("failed to wait for remote command completion")
            .map_err(Error::Transport)?;
        if !status.success() {
            return Err(Error::command_failed(command, status));
        }
        Ok(())
    }

    async fn has_command(&self, program: &str) -> Result<bool, Error> {
        let output = self
            .connection
            .command("sh")
            .arg("-c")
            .arg(format!("command -v {}", shell_escape(program)))
            .output()
            .await
            .with_context(|| format!("failed to query {} on {}", program, self.session))
            .map_err(Error::Transport)?;
        Ok(output.status.success())
    }
}

/// Runs every step on the local machine; "remote" paths are local paths.
#[derive(Debug, Default, Clone)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn host(&self) -> String {
        "local".to_string()
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> Result<(), Error> {
        let dst = Path::new(remote_path);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", parent))
                .map_err(Error::Transport)?;
        }
        let temp = dst.with_extension("tmp");
        tokio::fs::copy(local, &temp)
            .await
            .with_context(|| format!("failed copying {:?} to {:?}", local, &temp))
            .map_err(Error::Transport)?;
        tokio::fs::rename(&temp, dst)
            .await
            .with_context(|| format!("failed renaming {:?} to {:?}", &temp, dst))
            .map_err(Error::Transport)
    }

    async fn run(&self, command: &str, handler: &mut dyn DataHandler) -> Result<(), Error> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", command))
            .map_err(Error::Transport)?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .context("failed to get stdout for local command")
            .map_err(Error::Transport)?;
        let stderr = child
            .stderr
            .take()
            .context("failed to get stderr for local command")
            .map_err(Error::Transport)?;
        let mut state = ChannelState::new(self.host());
        drive_channel(stdin, stdout, stderr, handler, &mut state)
            .await
            .map_err(Error::Transport)?;
        let status = child
            .wait()
            .await
            .context("failed to wait for local command completion")
            .map_err(Error::Transport)?;
        if !status.success() {
            return Err(Error::command_failed(command, status));
        }
        Ok(())
    }

    async fn has_command(&self, program: &str) -> Result<bool, Error> {
        Ok(common::command::has_local_command(program).await)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Ssh,
    Local,
}

impl std::str::FromStr for TransportKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches(':').to_ascii_lowercase().as_str() {
            "ssh" => Ok(TransportKind::Ssh),
            "local" => Ok(TransportKind::Local),
            _ => Err(Error::Config(format!(
                "invalid transport {:?}, expected ssh or local",
                s
            ))),
        }
    }
}

/// A transport opened towards one selected server.
pub enum Connection {
    Ssh(SshTransport),
    Local(LocalTransport),
}

impl Connection {
    pub async fn open(kind: TransportKind, session: &SshSession) -> Result<Self, Error> {
        match kind {
            TransportKind::Ssh => Ok(Connection::Ssh(SshTransport::connect(session).await?)),
            TransportKind::Local => Ok(Connection::Local(LocalTransport)),
        }
    }
}

impl Transport for Connection {
    fn host(&self) -> String {
        match self {
            Connection::Ssh(transport) => transport.host(),
            Connection::Local(transport) => transport.host(),
        }
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> Result<(), Error> {
        match self {
            Connection::Ssh(transport) => transport.upload(local, remote_path).await,
            Connection::Local(transport) => transport.upload(local, remote_path).await,
        }
    }

    async fn run(&self, command: &str, handler: &mut dyn DataHandler) -> Result<(), Error> {
        match self {
            Connection::Ssh(transport) => transport.run(command, handler).await,
            Connection::Local(transport) => transport.run(command, handler).await,
        }
    }

    async fn has_command(&self, program: &str) -> Result<bool, Error> {
        match self {
            Connection::Ssh(transport) => transport.has_command(program).await,
            Connection::Local(transport) => transport.has_command(program).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{NoopHandler, PromptResponder};
    use common::compression::{Compression, CompressionType};
    use tracing_test::traced_test;

    #[test]
    fn test_remote_filename() {
        assert_eq!(
            remote_filename("/tmp", Path::new("/var/stage/20240101.tar.gz")).unwrap(),
            "/tmp/20240101.tar.gz"
        );
        assert_eq!(
            remote_filename("/tmp/", Path::new("rel.zip")).unwrap(),
            "/tmp/rel.zip"
        );
        assert!(remote_filename("/tmp", Path::new("/")).is_err());
    }

    #[test]
    fn test_unpack_command() {
        let gzip = Compression::new(CompressionType::Gzip, "tar", "tar");
        let command = unpack_command(
            "/u/apps/foo/releases",
            &gzip.decompress("/tmp/1.tar.gz"),
            "/tmp/1.tar.gz",
        );
        assert_eq!(
            command,
            "cd /u/apps/foo/releases && tar xzf /tmp/1.tar.gz && rm /tmp/1.tar.gz"
        );
    }

    #[test]
    fn test_unpack_command_escapes() {
        let zip = Compression::new(CompressionType::Zip, "tar", "tar");
        let command = unpack_command("/srv/my app", &zip.decompress("/tmp/a b.zip"), "/tmp/a b.zip");
        assert_eq!(
            command,
            "cd '/srv/my app' && unzip -q '/tmp/a b.zip' && rm '/tmp/a b.zip'"
        );
    }

    #[test]
    fn test_upload_command() -> anyhow::Result<()> {
        assert_eq!(
            upload_command("/tmp/r.tar.gz")?,
            "mkdir -p /tmp && cat > /tmp/.r.tar.gz.tmp.$$ && mv -f /tmp/.r.tar.gz.tmp.$$ /tmp/r.tar.gz"
        );
        Ok(())
    }

    #[test]
    fn test_upload_command_escapes() -> anyhow::Result<()> {
        assert_eq!(
            upload_command("/tmp/a b/r.tar.gz")?,
            "mkdir -p '/tmp/a b' && cat > '/tmp/a b'/.r.tar.gz.tmp.$$ \
             && mv -f '/tmp/a b'/.r.tar.gz.tmp.$$ '/tmp/a b/r.tar.gz'"
        );
        assert_eq!(
            upload_command("/srv/$(id)/it's.zip")?,
            "mkdir -p '/srv/$(id)' && cat > '/srv/$(id)'/'.it'\\''s.zip'.tmp.$$ \
             && mv -f '/srv/$(id)'/'.it'\\''s.zip'.tmp.$$ '/srv/$(id)/it'\\''s.zip'"
        );
        assert!(upload_command("/").is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_local_upload_and_unpack() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let release = tmp_dir.path().join("stage").join("20240101");
        std::fs::create_dir_all(&release)?;
        std::fs::write(release.join("app.rb"), "puts 1")?;
        let archive = tmp_dir.path().join("stage").join("20240101.tar.gz");
        let gzip = Compression::new(CompressionType::Gzip, "tar", "tar");
        common::compression::package(&gzip, &release, &archive).await?;
        let releases = tmp_dir.path().join("releases");
        std::fs::create_dir(&releases)?;
        let remote_dir = tmp_dir.path().join("remote-tmp");
        let uploaded = upload_and_unpack(
            &LocalTransport,
            &archive,
            remote_dir.to_str().unwrap(),
            releases.to_str().unwrap(),
            &gzip,
            &mut NoopHandler,
        )
        .await?;
        assert_eq!(
            std::fs::read_to_string(releases.join("20240101").join("app.rb"))?,
            "puts 1"
        );
        // the uploaded copy is deleted by the unpack command
        assert!(!Path::new(&uploaded).exists());
        // the local archive is untouched
        assert!(archive.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_local_unpack_missing_releases_dir_fails() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let archive = tmp_dir.path().join("x.tar.gz");
        std::fs::write(&archive, "not really an archive")?;
        let gzip = Compression::new(CompressionType::Gzip, "tar", "tar");
        let res = upload_and_unpack(
            &LocalTransport,
            &archive,
            tmp_dir.path().join("up").to_str().unwrap(),
            tmp_dir.path().join("nope").to_str().unwrap(),
            &gzip,
            &mut NoopHandler,
        )
        .await;
        assert!(matches!(res, Err(Error::CommandFailed { .. })));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_local_run_answers_prompt() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let answer = tmp_dir.path().join("answer");
        let command = format!(
            "printf 'Password: '; read reply; echo \"$reply\" > {}",
            shell_escape(answer.to_str().unwrap())
        );
        let mut handler = PromptResponder::new(1).respond_to("Password:", "hunter2\n")?;
        LocalTransport.run(&command, &mut handler).await?;
        assert_eq!(std::fs::read_to_string(&answer)?, "hunter2\n");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_local_run_reports_exit_code() {
        let res = LocalTransport.run("echo oops >&2; exit 4", &mut NoopHandler).await;
        assert!(matches!(res, Err(Error::CommandFailed { code: Some(4), .. })));
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("ssh".parse::<TransportKind>().unwrap(), TransportKind::Ssh);
        assert_eq!(":Local".parse::<TransportKind>().unwrap(), TransportKind::Local);
        assert!(matches!(
            "rsync".parse::<TransportKind>(),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_local_connection_ignores_session() -> anyhow::Result<()> {
        let connection = Connection::open(TransportKind::Local, &SshSession::local()).await?;
        assert_eq!(connection.host(), "local");
        assert!(connection.has_command("sh").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_has_command() -> anyhow::Result<()> {
        assert!(LocalTransport.has_command("tar").await?);
        assert!(!LocalTransport.has_command("definitely-not-a-real-binary-rstage").await?);
        Ok(())
    }
}
