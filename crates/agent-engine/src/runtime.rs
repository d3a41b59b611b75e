use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;

/// A fully resolved child-process invocation with captured stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Working directory; `None` inherits the agent's.
    pub cwd: Option<PathBuf>,
    /// File receiving the child's stdout.
    pub stdout_path: PathBuf,
    /// File receiving the child's stderr.
    pub stderr_path: PathBuf,
}

/// Execution seam shared by the container and host paths, substitutable in
/// tests.
#[async_trait]
pub trait CommandRuntime: Send + Sync {
    /// Run the invocation to completion and return the child's exit code
    /// (-1 when the child was terminated by a signal). Spawn failures are
    /// errors; non-zero exits are not.
    async fn run(&self, invocation: &Invocation) -> anyhow::Result<i32>;
}

/// [`CommandRuntime`] backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRuntime;

#[async_trait]
impl CommandRuntime for ProcessRuntime {
    async fn run(&self, invocation: &Invocation) -> anyhow::Result<i32> {
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty argv"))?;

        let stdout = std::fs::File::create(&invocation.stdout_path)
            .with_context(|| format!("create {}", invocation.stdout_path.display()))?;
        let stderr = std::fs::File::create(&invocation.stderr_path)
            .with_context(|| format!("create {}", invocation.stderr_path.display()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        let status = cmd
            .status()
            .await
            .with_context(|| format!("spawn {program}"))?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn captures_stdio_and_reports_exit_codes() {
        let dir = TempDir::new().unwrap();
        let invocation = Invocation {
            argv: vec![
                "/bin/bash".to_string(),
                "-lc".to_string(),
                "echo out; echo err >&2; exit 7".to_string(),
            ],
            cwd: Some(dir.path().to_path_buf()),
            stdout_path: dir.path().join("stdout.log"),
            stderr_path: dir.path().join("stderr.log"),
        };

        let code = ProcessRuntime.run(&invocation).await.unwrap();

        assert_eq!(code, 7);
        let stdout = std::fs::read_to_string(&invocation.stdout_path).unwrap();
        assert!(stdout.ends_with("out\n"));
        let stderr = std::fs::read_to_string(&invocation.stderr_path).unwrap();
        assert!(stderr.ends_with("err\n"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = TempDir::new().unwrap();
        let invocation = Invocation {
            argv: vec!["/nonexistent/definitely-not-a-binary".to_string()],
            cwd: None,
            stdout_path: dir.path().join("stdout.log"),
            stderr_path: dir.path().join("stderr.log"),
        };

        assert!(ProcessRuntime.run(&invocation).await.is_err());
    }
}
