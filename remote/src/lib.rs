//! Remote side of a release: archive transfer, unpacking and server selection
//!
//! The [`transport::Transport`] trait is the seam towards the remote-execution layer.
//! [`transport::SshTransport`] implements it on top of `openssh`, and
//! [`transport::LocalTransport`] runs the same steps on the local machine.

use anyhow::Context;

pub mod handler;
pub mod select;
pub mod transport;

pub use common::shell_escape;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSession {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshSession {
    pub fn local() -> Self {
        Self {
            user: None,
            host: "localhost".to_string(),
            port: None,
        }
    }
    /// `ssh://` destination understood by `openssh`
    pub fn destination(&self) -> String {
        let host = self.host.as_str();
        match (self.user.as_deref(), self.port) {
            (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
            (None, Some(port)) => format!("ssh://{host}:{port}"),
            (Some(user), None) => format!("ssh://{user}@{host}"),
            (None, None) => format!("ssh://{host}"),
        }
    }
}

impl std::fmt::Display for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

pub(crate) async fn setup_ssh_session(
    session: &SshSession,
) -> anyhow::Result<std::sync::Arc<openssh::Session>> {
    let destination = session.destination();
    tracing::debug!("Connecting to SSH destination: {}", destination);
    let session = std::sync::Arc::new(
        openssh::Session::connect(destination, openssh::KnownHosts::Strict)
            .await
            .context("Failed to establish SSH connection")?,
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination() {
        let session = SshSession {
            user: Some("deploy".to_string()),
            host: "web1".to_string(),
            port: Some(2222),
        };
        assert_eq!(session.destination(), "ssh://deploy@web1:2222");
        assert_eq!(session.to_string(), "deploy@web1:2222");
        assert_eq!(SshSession::local().destination(), "ssh://localhost");
        assert_eq!(SshSession::local().to_string(), "localhost");
    }
}
