//! External command execution.
//!
//! Backends never spawn processes directly; they go through a [`CommandRunner`]
//! so every call carries a timeout and can be replaced in tests.

use std::{fmt, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{UpkgError, UpkgResult};

/// Package metadata queries (`rpm -qp`, `dpkg-deb -f`).
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
/// Unpacking a package into the install directory.
pub const EXTRACT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Format conversion and system package manager installs.
pub const SYSTEM_INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Desktop database and icon cache refresh.
pub const CACHE_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: METADATA_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Output with exit code 0 and the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion.
    ///
    /// A non-zero exit status is not an error here; spawn failures and timeouts are.
    async fn run(&self, spec: &CommandSpec) -> UpkgResult<CommandOutput>;

    /// Returns true if `program` can be found on `PATH`.
    fn exists(&self, program: &str) -> bool;

    /// Runs `spec` and turns a non-zero exit into [`UpkgError::ExternalToolFailure`].
    async fn run_checked(&self, spec: &CommandSpec) -> UpkgResult<CommandOutput> {
        let output = self.run(spec).await?;
        if output.success() {
            return Ok(output);
        }

        let reason = match output.status {
            Some(code) => {
                let stderr = output.stderr.trim();
                if stderr.is_empty() {
                    format!("exited with status {code}")
                } else {
                    format!("exited with status {code}: {stderr}")
                }
            }
            None => "terminated by signal".to_string(),
        };
        Err(UpkgError::ExternalToolFailure {
            command: spec.to_string(),
            reason,
        })
    }
}

/// Runs commands on the host with tokio.
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> UpkgResult<CommandOutput> {
        debug!(command = %spec, cwd = ?spec.cwd, timeout = ?spec.timeout, "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(spec.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(UpkgError::ExternalToolFailure {
                    command: spec.to_string(),
                    reason: format!("failed to start: {err}"),
                })
            }
            Err(_) => {
                return Err(UpkgError::ExternalToolFailure {
                    command: spec.to_string(),
                    reason: format!("timed out after {}s", spec.timeout.as_secs()),
                })
            }
        };

        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if output.success() {
            trace!(command = %spec, "command finished");
        } else {
            debug!(
                command = %spec,
                status = ?output.status,
                stderr = %output.stderr.trim(),
                "command failed"
            );
        }
        Ok(output)
    }

    fn exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}


#[cfg(test)]
mod tests {
    use super::{mock::MockCommandRunner, *};

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemCommandRunner;
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_system_runner_times_out() {
        let runner = SystemCommandRunner;
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let err = runner.run(&spec).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let runner = MockCommandRunner::new()
            .with_handler("rpm", |_| Ok(CommandOutput::failed(1, "not an rpm package")));
        let err = runner
            .run_checked(&CommandSpec::new("rpm").args(["-qp", "x.rpm"]))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "`rpm -qp x.rpm` failed: exited with status 1: not an rpm package"
        );
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let runner = MockCommandRunner::new().with_program("true");
        assert!(runner.exists("true"));
        assert!(!runner.exists("alien"));

        runner.run(&CommandSpec::new("true")).await.unwrap();
        assert!(runner.run(&CommandSpec::new("alien")).await.is_err());
        assert_eq!(runner.calls().len(), 2);
        assert!(runner.called("alien"));
    }

    #[test]
    fn test_missing_program_does_not_exist() {
        assert!(!SystemCommandRunner.exists("definitely-not-a-real-upkg-tool"));
    }
}
