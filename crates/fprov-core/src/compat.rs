use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::catalog::version_key;
use crate::device::DeviceHandle;
use crate::error::{ProvisionError, Result};
use crate::parse::{parse_server_filename, parse_tool_version};
use crate::provisioner::Provisioner;

const PIP_TIMEOUT: Duration = Duration::from_secs(600);

/// Host-side frida tooling: the `frida` CLI and the package manager that
/// installs it.
#[async_trait]
pub trait ClientTooling: Send + Sync {
    /// `None` when the client is not installed.
    async fn client_version(&self) -> Result<Option<String>>;

    async fn install_client(&self, version: &str) -> Result<()>;
}

/// `frida --version` and `pip install frida==<v> frida-tools`.
pub struct FridaTools {
    frida: PathBuf,
    pip: PathBuf,
    timeout: Duration,
}

impl FridaTools {
    pub fn new(timeout: Duration) -> Self {
        let pip = ["pip", "pip3"]
            .iter()
            .find_map(|name| which::which(name).ok())
            .unwrap_or_else(|| PathBuf::from("pip"));
        Self {
            frida: PathBuf::from("frida"),
            pip,
            timeout,
        }
    }

    async fn run(&self, program: &Path, args: &[&str], timeout: Duration) -> Result<Output> {
        let command = format!("{} {}", program.display(), args.join(" "));
        debug!("exec: {command}");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                Err(ProvisionError::ToolUnavailable {
                    tool: program.display().to_string(),
                    message: "not found on PATH".into(),
                })
            }
            Ok(Err(err)) => Err(ProvisionError::ToolUnavailable {
                tool: program.display().to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(ProvisionError::Timeout {
                command,
                after: timeout,
            }),
        }
    }
}

#[async_trait]
impl ClientTooling for FridaTools {
    async fn client_version(&self) -> Result<Option<String>> {
        match self.run(&self.frida, &["--version"], self.timeout).await {
            Ok(output) if output.status.success() => {
                Ok(parse_tool_version(&String::from_utf8_lossy(&output.stdout)))
            }
            Ok(output) => {
                debug!("frida --version exited with {}", output.status);
                Ok(None)
            }
            Err(ProvisionError::ToolUnavailable { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn install_client(&self, version: &str) -> Result<()> {
        let pin = format!("frida=={version}");
        let args = ["install", pin.as_str(), "frida-tools"];
        info!("Installing frida client {version}");
        let output = self
            .run(&self.pip, &args, PIP_TIMEOUT.max(self.timeout))
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::LocalToolFailed {
                command: format!("{} {}", self.pip.display(), args.join(" ")),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompatStatus {
    Match,
    /// Same major.minor; usually works.
    Compatible,
    Mismatch,
    Unknown,
    NotInstalled,
}

impl fmt::Display for CompatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompatStatus::Match => "match",
            CompatStatus::Compatible => "compatible",
            CompatStatus::Mismatch => "mismatch",
            CompatStatus::Unknown => "unknown",
            CompatStatus::NotInstalled => "not installed",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompatReport {
    pub client: Option<String>,
    pub server: Option<String>,
    pub status: CompatStatus,
}

impl CompatReport {
    /// Host command that brings the client in line with the server.
    pub fn fix_command(&self) -> Option<String> {
        match (self.status, self.server.as_deref()) {
            (CompatStatus::Match, _) | (_, None) => None,
            (_, Some(server)) => Some(format!("pip install frida=={server} frida-tools")),
        }
    }
}

pub fn compare_versions(client: Option<&str>, server: Option<&str>) -> CompatStatus {
    let Some(client) = client else {
        return CompatStatus::NotInstalled;
    };
    let Some(server) = server else {
        return CompatStatus::Unknown;
    };
    if client.trim_start_matches('v') == server.trim_start_matches('v') {
        return CompatStatus::Match;
    }
    match (version_key(client), version_key(server)) {
        (Some(c), Some(s)) if c == s => CompatStatus::Match,
        (Some(c), Some(s)) if c.major == s.major && c.minor == s.minor => CompatStatus::Compatible,
        (Some(_), Some(_)) => CompatStatus::Mismatch,
        _ => CompatStatus::Unknown,
    }
}

impl Provisioner {
    /// Version of the running server, else of the newest installed binary.
    pub async fn server_version(&self, device: &DeviceHandle) -> Result<Option<String>> {
        let running = self
            .server_processes(&device.serial)
            .await?
            .into_iter()
            .find_map(|p| parse_server_filename(p.executable_name()).map(|(v, _)| v));
        if running.is_some() {
            return Ok(running);
        }
        Ok(self
            .list_installed(device, None)
            .await?
            .into_iter()
            .next()
            .map(|binary| binary.version))
    }

    pub async fn compatibility(&self, device: &DeviceHandle) -> Result<CompatReport> {
        let client = self.client_tooling().client_version().await?;
        let server = self.server_version(device).await?;
        let status = compare_versions(client.as_deref(), server.as_deref());
        Ok(CompatReport {
            client,
            server,
            status,
        })
    }

    /// Installs the client matching the server. Returns `false` when the
    /// versions already match.
    pub async fn fix_compatibility(&self, report: &CompatReport) -> Result<bool> {
        if report.status == CompatStatus::Match {
            return Ok(false);
        }
        let Some(server) = report.server.as_deref() else {
            return Err(ProvisionError::NotInstalled {
                version: "any".into(),
                path: self.config().server_dir.clone(),
            });
        };
        self.client_tooling().install_client(server).await?;
        Ok(true)
    }

    /// Warns when the host client differs from `server_version`; fails with
    /// `ProtocolMismatch` instead when strict matching is configured.
    pub(crate) async fn check_client_parity(&self, server_version: &str) -> Result<()> {
        let client = match self.client_tooling().client_version().await {
            Ok(client) => client,
            Err(err) => {
                debug!("client version probe failed: {err}");
                None
            }
        };
        match compare_versions(client.as_deref(), Some(server_version)) {
            CompatStatus::Match => Ok(()),
            CompatStatus::NotInstalled => {
                debug!("no frida client on host; skipping version check");
                Ok(())
            }
            status => {
                let client = client.unwrap_or_default();
                if self.config().strict_client_match {
                    return Err(ProvisionError::ProtocolMismatch {
                        server: server_version.to_string(),
                        client,
                    });
                }
                warn!("frida client {client} and server {server_version} differ ({status}); run `pip install frida=={server_version} frida-tools`");
                Ok(())
            }
        }
    }
}
