use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Result of one `adb shell` invocation. A non-zero `status` is not an
/// error at this layer; callers decide what a failing device command means.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// The subset of the device bridge the provisioner needs. The production
/// implementation is [`AdbBridge`]; tests substitute a scripted fake.
#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// First line of `adb version`.
    async fn version(&self) -> Result<String>;

    /// Raw `adb devices -l` output.
    async fn devices(&self) -> Result<String>;

    /// Runs `command` through the device shell, wrapped in `su -c` when
    /// `elevated` is set.
    async fn shell(&self, serial: &str, command: &str, elevated: bool) -> Result<ShellOutput>;

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()>;

    async fn forward(&self, serial: &str, local_port: u16, remote_port: u16) -> Result<()>;
}

pub struct AdbBridge {
    program: PathBuf,
    timeout: Duration,
}

impl AdbBridge {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn describe(&self, args: &[&str]) -> String {
        let mut out = self.program.to_string_lossy().to_string();
        for arg in args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        let command = self.describe(args);
        debug!("exec: {command}");
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                Err(ProvisionError::BridgeUnavailable {
                    path: self.program.to_string_lossy().to_string(),
                })
            }
            Ok(Err(err)) => Err(ProvisionError::BridgeIo {
                command,
                message: err.to_string(),
            }),
            Err(_) => Err(ProvisionError::Timeout {
                command,
                after: self.timeout,
            }),
        }
    }

    async fn checked(&self, step: &'static str, args: &[&str]) -> Result<Output> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(ProvisionError::BridgeCommand {
                step,
                command: self.describe(args),
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

#[async_trait]
impl BridgeClient for AdbBridge {
    async fn version(&self) -> Result<String> {
        let output = self.checked("adb version", &["version"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn devices(&self) -> Result<String> {
        let output = self.checked("list devices", &["devices", "-l"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn shell(&self, serial: &str, command: &str, elevated: bool) -> Result<ShellOutput> {
        let command = if elevated {
            elevated_command(command)
        } else {
            command.to_string()
        };
        let output = self.output(&["-s", serial, "shell", &command]).await?;
        Ok(ShellOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        self.checked("push", &["-s", serial, "push", &local, remote])
            .await?;
        Ok(())
    }

    async fn forward(&self, serial: &str, local_port: u16, remote_port: u16) -> Result<()> {
        let local = format!("tcp:{local_port}");
        let remote = format!("tcp:{remote_port}");
        self.checked("forward", &["-s", serial, "forward", &local, &remote])
            .await?;
        Ok(())
    }
}

/// Wraps a device command for `su`. adb joins shell arguments with spaces,
/// so the inner command travels as one single-quoted word.
pub(crate) fn elevated_command(command: &str) -> String {
    format!("su -c {}", shell_quote(command))
}

pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
