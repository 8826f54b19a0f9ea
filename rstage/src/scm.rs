//! Source control collaborators producing the initial tree of a release

use common::Error;
use remote::handler::{DataHandler, NoopHandler, PromptResponder};
use remote::shell_escape;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScmKind {
    #[default]
    Git,
    /// the repository is a plain local directory
    None,
}

impl std::str::FromStr for ScmKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches(':').to_ascii_lowercase().as_str() {
            "git" => Ok(ScmKind::Git),
            "none" => Ok(ScmKind::None),
            _ => Err(Error::Config(format!(
                "invalid scm {:?}, expected git or none",
                s
            ))),
        }
    }
}

/// Builds the local shell commands that materialize a revision into a directory.
pub trait Scm: Send + Sync {
    /// Local binary the commands depend on.
    fn local_command(&self) -> &str;
    /// Full working copy of `revision` in `destination`.
    fn checkout(&self, revision: &str, destination: &Path) -> String;
    /// Like [`Scm::checkout`] but without version-control metadata.
    fn export(&self, revision: &str, destination: &Path) -> String;
    /// Bring an existing working copy in `destination` to `revision`.
    fn sync(&self, revision: &str, destination: &Path) -> String;
    /// Answers interactive prompts on remote channels.
    fn handler(&self) -> Box<dyn DataHandler>;
}

fn quote(path: &Path) -> String {
    shell_escape(&path.to_string_lossy())
}

pub struct Git {
    repository: String,
    password: Option<String>,
}

impl Git {
    pub fn new(repository: &str, password: Option<&str>) -> Self {
        Self {
            repository: repository.to_string(),
            password: password.map(str::to_string),
        }
    }
}

impl Scm for Git {
    fn local_command(&self) -> &str {
        "git"
    }

    fn checkout(&self, revision: &str, destination: &Path) -> String {
        let destination = quote(destination);
        format!(
            "git clone -q {} {} && cd {} && git checkout -q -b deploy {}",
            shell_escape(&self.repository),
            &destination,
            &destination,
            shell_escape(revision)
        )
    }

    fn export(&self, revision: &str, destination: &Path) -> String {
        format!(
            "{} && rm -Rf {}",
            self.checkout(revision, destination),
            quote(&destination.join(".git"))
        )
    }

    fn sync(&self, revision: &str, destination: &Path) -> String {
        format!(
            "cd {} && git fetch -q origin && git fetch --tags -q origin && git reset -q --hard {} && git clean -q -d -x -f",
            quote(destination),
            shell_escape(revision)
        )
    }

    fn handler(&self) -> Box<dyn DataHandler> {
        let mut rules = vec![(r"\(yes/no\)", "yes\n".to_string())];
        if let Some(password) = &self.password {
            rules.push((r"(?i)\bpassword.*:", format!("{}\n", password)));
        }
        let responder = rules
            .into_iter()
            .try_fold(PromptResponder::new(1), |responder, (prompt, response)| {
                responder.respond_to(prompt, &response)
            });
        match responder {
            Ok(responder) => Box::new(responder) as Box<dyn DataHandler>,
            Err(error) => {
                tracing::warn!("not answering git prompts: {:#}", error);
                Box::new(NoopHandler)
            }
        }
    }
}

/// Copies a local directory; revisions are recorded but not resolved.
pub struct NoScm {
    repository: String,
}

impl NoScm {
    pub fn new(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
        }
    }
}

impl Scm for NoScm {
    fn local_command(&self) -> &str {
        "cp"
    }

    fn checkout(&self, _revision: &str, destination: &Path) -> String {
        format!("cp -R {} {}", shell_escape(&self.repository), quote(destination))
    }

    fn export(&self, revision: &str, destination: &Path) -> String {
        self.checkout(revision, destination)
    }

    fn sync(&self, revision: &str, destination: &Path) -> String {
        format!(
            "rm -rf {} && {}",
            quote(destination),
            self.checkout(revision, destination)
        )
    }

    fn handler(&self) -> Box<dyn DataHandler> {
        Box::new(NoopHandler)
    }
}

pub fn scm(
    kind: ScmKind,
    repository: Option<&str>,
    password: Option<&str>,
) -> Result<Box<dyn Scm>, Error> {
    let repository =
        repository.ok_or_else(|| Error::Config("repository must be set".to_string()))?;
    let scm: Box<dyn Scm> = match kind {
        ScmKind::Git => Box::new(Git::new(repository, password)),
        ScmKind::None => Box::new(NoScm::new(repository)),
    };
    Ok(scm)
}
