//! External command execution
//!
//! Every delegated program (docker, ufw, systemctl, openssl) goes through the
//! [`CommandRunner`] seam so controllers can be exercised without a host.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{VpnctlError, VpnctlResult};
use crate::validation;

/// A single program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
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

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-like rendering for logs and error messages
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output; a non-zero exit is not an error here
    async fn output(&self, invocation: &Invocation) -> VpnctlResult<CommandOutput>;
}

/// Runs programs on the host through `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn output(&self, invocation: &Invocation) -> VpnctlResult<CommandOutput> {
        debug!("Running: {}", invocation.command_line());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        let spawn_error = |e: std::io::Error| VpnctlError::ExternalProcess {
            cmd: invocation.command_line(),
            code: None,
            stderr: e.to_string(),
        };

        let output = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| VpnctlError::ExternalProcess {
                    cmd: invocation.command_line(),
                    code: None,
                    stderr: format!("timed out after {}s", limit.as_secs()),
                })?
                .map_err(spawn_error)?,
            None => cmd.output().await.map_err(spawn_error)?,
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Run a command whose failure must abort the current operation
pub async fn run_checked(
    runner: &dyn CommandRunner,
    invocation: Invocation,
) -> VpnctlResult<CommandOutput> {
    let output = runner.output(&invocation).await?;
    if !output.success() {
        return Err(VpnctlError::ExternalProcess {
            cmd: invocation.command_line(),
            code: output.code,
            stderr: validation::sanitize_error_message(&output.stderr_lossy()),
        });
    }
    Ok(output)
}

/// Run a command whose failure is only worth a warning
///
/// Returns the warning text when the command did not succeed.
pub async fn run_best_effort(runner: &dyn CommandRunner, invocation: Invocation) -> Option<String> {
    match run_checked(runner, invocation).await {
        Ok(_) => None,
        Err(e) => {
            warn!("{}", e);
            Some(e.to_string())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[test]
    fn test_command_line_rendering() {
        let inv = Invocation::new("ufw")
            .args(["allow", "8443/udp"])
            .arg("comment")
            .arg("Hysteria2 (Auto)");
        assert_eq!(inv.command_line(), "ufw allow 8443/udp comment Hysteria2 (Auto)");
    }

    #[tokio::test]
    async fn test_run_checked_reports_failure() {
        let runner = RecordingRunner::new();
        runner.fail("ufw", "ERROR: You need to be root");

        let err = run_checked(&runner, Invocation::new("ufw").arg("status"))
            .await
            .unwrap_err();
        match err {
            VpnctlError::ExternalProcess { cmd, code, stderr } => {
                assert_eq!(cmd, "ufw status");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "ERROR: You need to be root");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_best_effort_returns_warning() {
        let runner = RecordingRunner::new();
        runner.fail("systemctl", "unit not found");

        let warning = run_best_effort(&runner, Invocation::new("systemctl").args(["restart", "fail2ban"])).await;
        assert!(warning.unwrap().contains("unit not found"));

        let ok = run_best_effort(&runner, Invocation::new("true")).await;
        assert!(ok.is_none());
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .output(&Invocation::new("/nonexistent/vpnctl-test-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, VpnctlError::ExternalProcess { code: None, .. }));
    }
}
