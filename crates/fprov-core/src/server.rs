use tracing::{debug, info, warn};

use crate::bridge::shell_quote;
use crate::config::DEFAULT_PORT;
use crate::device::DeviceHandle;
use crate::error::{ProvisionError, Result};
use crate::parse::{parse_listening_ports, parse_processes, parse_server_filename, ProcessEntry};
use crate::provision::InstalledBinary;
use crate::provisioner::Provisioner;

/// A server process confirmed to be listening.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunningInstance {
    pub pids: Vec<u32>,
    pub port: u16,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    NotRunning,
    Running {
        pids: Vec<u32>,
        port: u16,
        listening: bool,
    },
}

impl ServerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ServerStatus::Running { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopReport {
    pub requested: usize,
    pub stopped: usize,
}

const PS_COMMANDS: [&str; 2] = ["ps -A -o PID,ARGS", "ps"];
const TCP_TABLES: &str = "cat /proc/net/tcp /proc/net/tcp6";

fn launch_command(path: &str, port: u16) -> String {
    let listen = if port == DEFAULT_PORT {
        String::new()
    } else {
        format!(" -l 0.0.0.0:{port}")
    };
    format!("nohup {}{listen} >/dev/null 2>&1 &", shell_quote(path))
}

impl Provisioner {
    /// Full process listing. Tries the elevated shell first so other users'
    /// processes are visible, then the plain shell, then legacy `ps`.
    async fn processes(&self, serial: &str) -> Result<Vec<ProcessEntry>> {
        for command in PS_COMMANDS {
            for elevated in [true, false] {
                let output = self.bridge().shell(serial, command, elevated).await?;
                if !output.success() {
                    continue;
                }
                let entries = parse_processes(&output.stdout);
                if !entries.is_empty() {
                    return Ok(entries);
                }
            }
        }
        debug!(serial, "no usable process listing");
        Ok(Vec::new())
    }

    /// Processes whose executable name starts with `frida-server`.
    pub(crate) async fn server_processes(&self, serial: &str) -> Result<Vec<ProcessEntry>> {
        Ok(self
            .processes(serial)
            .await?
            .into_iter()
            .filter(|p| p.executable_name().starts_with("frida-server"))
            .collect())
    }

    async fn listening_ports(&self, serial: &str) -> Result<Vec<u16>> {
        for elevated in [true, false] {
            // A missing tcp6 table makes `cat` exit non-zero after printing
            // the v4 table, so the status is not checked here.
            let output = self.bridge().shell(serial, TCP_TABLES, elevated).await?;
            let ports = parse_listening_ports(&output.stdout);
            if !ports.is_empty() {
                return Ok(ports);
            }
        }
        Ok(Vec::new())
    }

    pub async fn status(&self, device: &DeviceHandle, port: u16) -> Result<ServerStatus> {
        let serial = device.serial.as_str();
        let pids: Vec<u32> = self
            .server_processes(serial)
            .await?
            .iter()
            .map(|p| p.pid)
            .collect();
        if pids.is_empty() {
            return Ok(ServerStatus::NotRunning);
        }
        let listening = self.listening_ports(serial).await?.contains(&port);
        Ok(ServerStatus::Running {
            pids,
            port,
            listening,
        })
    }

    /// Launches `binary` detached under `su` and waits until both a matching
    /// process and a listening socket show up.
    pub async fn start(
        &self,
        device: &DeviceHandle,
        binary: &InstalledBinary,
        port: u16,
    ) -> Result<RunningInstance> {
        let serial = device.serial.as_str();
        self.require_root(device).await?;
        self.check_client_parity(&binary.version).await?;

        if let Some(instance) = self.observe_instance(serial, &binary.path, port).await? {
            info!("frida-server already running (pids {:?})", instance.pids);
            return Ok(instance);
        }

        // The poll below cannot tell which process owns the socket, so a
        // port that is already bound must be released first.
        if self.listening_ports(serial).await?.contains(&port) {
            let holders = self
                .server_processes(serial)
                .await?
                .iter()
                .filter(|p| p.executable() != binary.path)
                .map(|p| p.pid)
                .collect();
            return Err(ProvisionError::PortInUse { port, holders });
        }

        let command = launch_command(&binary.path, port);
        info!("Starting {} on port {port}", binary.path);
        let output = self.bridge().shell(serial, &command, true).await?;
        if !output.success() {
            return Err(ProvisionError::BridgeCommand {
                step: "start server",
                command,
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        let attempts = self.config().start_attempts.max(1);
        let mut seen_process = false;
        for attempt in 1..=attempts {
            let pids = self.pids_for(serial, &binary.path).await?;
            seen_process |= !pids.is_empty();
            if !pids.is_empty() && self.listening_ports(serial).await?.contains(&port) {
                info!("frida-server listening on port {port} (pids {pids:?})");
                return Ok(RunningInstance {
                    pids,
                    port,
                    path: binary.path.clone(),
                });
            }
            debug!(attempt, attempts, "waiting for frida-server");
            if attempt < attempts {
                tokio::time::sleep(self.config().start_poll_interval()).await;
            }
        }

        let detail = if seen_process {
            format!("process started but port {port} never entered LISTEN")
        } else {
            "no matching process appeared".to_string()
        };
        Err(ProvisionError::StartTimeout {
            path: binary.path.clone(),
            port,
            detail: format!("{detail} after {attempts} checks"),
        })
    }

    async fn pids_for(&self, serial: &str, path: &str) -> Result<Vec<u32>> {
        Ok(self
            .server_processes(serial)
            .await?
            .iter()
            .filter(|p| p.executable() == path)
            .map(|p| p.pid)
            .collect())
    }

    async fn observe_instance(
        &self,
        serial: &str,
        path: &str,
        port: u16,
    ) -> Result<Option<RunningInstance>> {
        let pids = self.pids_for(serial, path).await?;
        if pids.is_empty() || !self.listening_ports(serial).await?.contains(&port) {
            return Ok(None);
        }
        Ok(Some(RunningInstance {
            pids,
            port,
            path: path.to_string(),
        }))
    }

    /// Kills one pid, or every frida-server process when `pid` is `None`.
    /// Processes that are already gone are counted, not raised.
    pub async fn stop(&self, device: &DeviceHandle, pid: Option<u32>) -> Result<StopReport> {
        let serial = device.serial.as_str();
        let targets: Vec<u32> = match pid {
            Some(pid) => vec![pid],
            None => self
                .server_processes(serial)
                .await?
                .iter()
                .map(|p| p.pid)
                .collect(),
        };

        let mut report = StopReport {
            requested: targets.len(),
            stopped: 0,
        };
        for pid in targets {
            let output = self
                .bridge()
                .shell(serial, &format!("kill -9 {pid}"), true)
                .await?;
            if output.success() {
                report.stopped += 1;
            } else {
                debug!(pid, "kill failed: {}", output.stderr.trim());
            }
        }
        if report.requested == 0 {
            info!("no frida-server process running");
        } else {
            info!("stopped {}/{} frida-server process(es)", report.stopped, report.requested);
        }
        Ok(report)
    }

    /// Stops everything, then starts whatever binary was running before,
    /// or the newest installed one.
    pub async fn restart(&self, device: &DeviceHandle, port: u16) -> Result<RunningInstance> {
        let serial = device.serial.as_str();
        let previous = self
            .server_processes(serial)
            .await?
            .into_iter()
            .map(|p| p.executable().to_string())
            .find(|path| path.starts_with('/'));
        self.stop(device, None).await?;

        let binary = match previous {
            Some(path) => self.describe_binary(serial, &path).await?,
            None => None,
        };
        let binary = match binary {
            Some(binary) => binary,
            None => self
                .list_installed(device, None)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ProvisionError::NotInstalled {
                    version: "any".into(),
                    path: self.config().server_dir.clone(),
                })?,
        };
        self.start(device, &binary, port).await
    }

    async fn describe_binary(&self, serial: &str, path: &str) -> Result<Option<InstalledBinary>> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let Some((version, arch)) = parse_server_filename(name) else {
            warn!("running server {path} does not carry a version in its name");
            return Ok(None);
        };
        Ok(self
            .stat_remote(serial, path)
            .await?
            .map(|file| InstalledBinary {
                executable: file.owner_executable(),
                path: file.path,
                version,
                arch,
                size: file.size,
            }))
    }

    /// `adb forward tcp:<local> tcp:<remote>`.
    pub async fn forward(&self, device: &DeviceHandle, local_port: u16, remote_port: u16) -> Result<()> {
        self.bridge()
            .forward(&device.serial, local_port, remote_port)
            .await?;
        info!("forwarded tcp:{local_port} -> device tcp:{remote_port}");
        Ok(())
    }
}
