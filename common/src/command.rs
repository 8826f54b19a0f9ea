//! Local subprocess execution
//!
//! Every call hands back the exit status explicitly; a non-zero status becomes
//! [`Error::CommandFailed`](crate::Error::CommandFailed).

use anyhow::Context;
use std::path::Path;

use crate::Error;

/// Render an argv for logs and error messages.
pub fn display_argv<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| arg.as_ref())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Spawn `command` and wait for it, returning its exit status without judging it.
pub async fn status(
    mut command: tokio::process::Command,
    description: &str,
) -> Result<std::process::ExitStatus, Error> {
    command
        .status()
        .await
        .with_context(|| format!("failed to spawn {}", description))
        .map_err(Error::Filesystem)
}

/// Run an argv (first element is the program) in `cwd` and require success.
pub async fn run_argv<S: AsRef<str>>(argv: &[S], cwd: &Path) -> Result<(), Error> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Config("empty command".to_string()))?;
    let rendered = display_argv(argv);
    tracing::debug!("running {:?} in {:?}", &rendered, cwd);
    let mut command = tokio::process::Command::new(program.as_ref());
    command
        .args(args.iter().map(|arg| arg.as_ref()))
        .current_dir(cwd);
    let exit = status(command, &rendered).await?;
    if !exit.success() {
        return Err(Error::command_failed(rendered, exit));
    }
    Ok(())
}

/// Run a shell line through `sh -c` in `cwd` and require success.
pub async fn run_shell(line: &str, cwd: Option<&Path>) -> Result<(), Error> {
    tracing::debug!("running shell command {:?} in {:?}", line, cwd);
    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg(line);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let exit = status(command, line).await?;
    if !exit.success() {
        return Err(Error::command_failed(line, exit));
    }
    Ok(())
}

/// Whether `program` can be found on the local `PATH`.
pub async fn has_local_command(program: &str) -> bool {
    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(format!("command -v {}", crate::shell_escape(program)))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    matches!(status(command, "command -v").await, Ok(exit) if exit.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_run_argv_success() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        run_argv(&["touch", "created"], tmp_dir.path()).await?;
        assert!(tmp_dir.path().join("created").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_run_shell_reports_exit_code() -> Result<(), anyhow::Error> {
        match run_shell("exit 7", None).await {
            Err(Error::CommandFailed { command, code }) => {
                assert_eq!(command, "exit 7");
                assert_eq!(code, Some(7));
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_run_argv_missing_program() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let res = run_argv(&["definitely-not-a-real-binary-rstage"], tmp_dir.path()).await;
        assert!(matches!(res, Err(Error::Filesystem(_))));
    }

    #[tokio::test]
    async fn test_empty_argv_is_config_error() {
        let empty: [&str; 0] = [];
        let res = run_argv(&empty, Path::new("/")).await;
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_has_local_command() {
        assert!(has_local_command("sh").await);
        assert!(!has_local_command("definitely-not-a-real-binary-rstage").await);
    }
}
