use std::path::Path;

use tracing::{debug, info, warn};

use crate::bridge::shell_quote;
use crate::capability::Arch;
use crate::cancel::check_cancel;
use crate::catalog::version_key;
use crate::device::DeviceHandle;
use crate::error::{ProvisionError, Result};
use crate::hashing::sha256_file;
use crate::parse::{
    parse_ls_long, parse_path_listing, parse_server_filename, parse_sha256sum, RemoteFile,
};
use crate::provisioner::Provisioner;

/// A server binary that exists on the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledBinary {
    pub path: String,
    pub version: String,
    pub arch: Arch,
    pub size: u64,
    pub executable: bool,
}

impl InstalledBinary {
    fn from_remote(file: RemoteFile, version: &str, arch: Arch) -> Self {
        Self {
            executable: file.owner_executable(),
            path: file.path,
            version: version.to_string(),
            arch,
            size: file.size,
        }
    }
}

/// `frida-server-<version>-android-<arch>`; distinct per version and
/// architecture so several builds can sit side by side.
pub fn server_file_name(version: &str, arch: Arch) -> String {
    format!("frida-server-{version}-{}", arch.target())
}

/// Release tags are bare (`16.1.17`); a leading `v` is accepted and dropped.
fn normalize_version(version: &str) -> &str {
    let version = version.trim();
    version.strip_prefix('v').unwrap_or(version)
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

impl Provisioner {
    fn server_dir<'a>(&'a self, custom_dir: Option<&'a str>) -> &'a str {
        custom_dir
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or(&self.config().server_dir)
    }

    /// Stats a device path; missing, unreadable and zero-byte files are all
    /// `None`.
    pub(crate) async fn stat_remote(&self, serial: &str, path: &str) -> Result<Option<RemoteFile>> {
        let output = self
            .bridge()
            .shell(serial, &format!("ls -l {}", shell_quote(path)), false)
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_ls_long(&output.stdout).filter(|file| file.size > 0))
    }

    /// Makes sure `version` (or the newest release) is on the device and
    /// executable. An existing non-empty binary is reused without touching
    /// the catalog unless `force` is set.
    pub async fn ensure_installed(
        &self,
        device: &DeviceHandle,
        version: Option<&str>,
        custom_dir: Option<&str>,
        force: bool,
    ) -> Result<InstalledBinary> {
        let serial = device.serial.as_str();
        let arch = self.detect_architecture(device).await?;
        let version = match version
            .map(str::to_string)
            .or_else(|| self.config().default_version.clone())
        {
            Some(version) => version,
            None => self.catalog().latest_version().await?,
        };
        let version = normalize_version(&version).to_string();
        let path = join_remote(self.server_dir(custom_dir), &server_file_name(&version, arch));

        if !force {
            if let Some(file) = self.stat_remote(serial, &path).await? {
                info!("frida-server {version} already installed at {path}");
                let mut binary = InstalledBinary::from_remote(file, &version, arch);
                if !binary.executable {
                    self.chmod_executable(serial, &binary.path).await?;
                    binary.executable = true;
                }
                return Ok(binary);
            }
        }

        let release = self.catalog().release(&version, arch).await?;
        let local = self.fetch_server_binary(&release).await?;
        let pushed = self.push_binary(serial, &local, &path).await;
        self.discard_download(&local);
        pushed?;

        let file = self
            .stat_remote(serial, &path)
            .await?
            .ok_or_else(|| ProvisionError::PushError {
                local: local.display().to_string(),
                remote: path.clone(),
                message: "file is missing or empty after push".into(),
            })?;
        let binary = InstalledBinary::from_remote(file, &version, arch);
        info!("Installed frida-server {version} at {}", binary.path);
        Ok(binary)
    }

    /// Pushes into `<remote>.part`, verifies it there and only then moves it
    /// over `remote`. A failed transfer never leaves a file at `remote`.
    async fn push_binary(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        check_cancel(self.cancel(), "install")?;
        let staging = format!("{remote}.part");
        let result = self.push_staged(serial, local, &staging, remote).await;
        if result.is_err() {
            if let Err(err) = self.remove_remote(serial, &staging).await {
                warn!("could not remove {staging}: {err}");
            }
        }
        result
    }

    async fn push_staged(
        &self,
        serial: &str,
        local: &Path,
        staging: &str,
        remote: &str,
    ) -> Result<()> {
        let push_err = |message: String| ProvisionError::PushError {
            local: local.display().to_string(),
            remote: remote.to_string(),
            message,
        };

        info!("Pushing {} to {remote}", local.display());
        self.bridge()
            .push(serial, local, staging)
            .await
            .map_err(|err| match err {
                ProvisionError::BridgeCommand { stdout, stderr, .. } => {
                    let detail = if stderr.trim().is_empty() { stdout } else { stderr };
                    push_err(detail.trim().to_string())
                }
                other => other,
            })?;
        self.chmod_executable(serial, staging).await?;

        let expected = sha256_file(local)
            .map_err(|e| ProvisionError::io(format!("failed to hash {}", local.display()), e))?;
        let output = self
            .bridge()
            .shell(serial, &format!("sha256sum {}", shell_quote(staging)), false)
            .await?;
        match parse_sha256sum(&output.stdout).filter(|_| output.success()) {
            Some(actual) if actual == expected => debug!("sha256 verified for {staging}"),
            Some(actual) => {
                return Err(push_err(format!(
                    "sha256 mismatch after push: local {expected}, device {actual}"
                )))
            }
            None => warn!("device has no usable sha256sum; skipped integrity check of {remote}"),
        }

        let command = format!("mv -f {} {}", shell_quote(staging), shell_quote(remote));
        let mut output = self.bridge().shell(serial, &command, false).await?;
        if !output.success() {
            debug!("mv as shell failed, retrying elevated");
            output = self.bridge().shell(serial, &command, true).await?;
        }
        if output.success() {
            Ok(())
        } else {
            Err(push_err(format!("`{command}` failed: {}", output.stderr.trim())))
        }
    }

    /// `rm -f`, retried under `su` when the file survives.
    async fn remove_remote(&self, serial: &str, path: &str) -> Result<()> {
        let command = format!("rm -f {}", shell_quote(path));
        for elevated in [false, true] {
            let output = self.bridge().shell(serial, &command, elevated).await?;
            if output.success() && self.stat_remote(serial, path).await?.is_none() {
                return Ok(());
            }
        }
        Err(ProvisionError::BridgeCommand {
            step: "remove",
            command,
            status: 1,
            stdout: String::new(),
            stderr: format!("{path} is still present"),
        })
    }

    async fn chmod_executable(&self, serial: &str, remote: &str) -> Result<()> {
        let command = format!("chmod 755 {}", shell_quote(remote));
        let mut output = self.bridge().shell(serial, &command, false).await?;
        if !output.success() {
            debug!("chmod as shell failed, retrying elevated");
            output = self.bridge().shell(serial, &command, true).await?;
        }
        if output.success() {
            Ok(())
        } else {
            Err(ProvisionError::PushError {
                local: remote.to_string(),
                remote: remote.to_string(),
                message: format!("`{command}` failed: {}", output.stderr.trim()),
            })
        }
    }

    /// Server binaries present in the server directory, newest first.
    pub async fn list_installed(
        &self,
        device: &DeviceHandle,
        custom_dir: Option<&str>,
    ) -> Result<Vec<InstalledBinary>> {
        let serial = device.serial.as_str();
        let dir = self.server_dir(custom_dir).trim_end_matches('/');
        let output = self
            .bridge()
            .shell(serial, &format!("ls -1 {}/frida-server-*", shell_quote(dir)), false)
            .await?;

        let mut binaries = Vec::new();
        for path in parse_path_listing(&output.stdout) {
            let name = path.rsplit('/').next().unwrap_or(&path);
            let Some((version, arch)) = parse_server_filename(name) else {
                debug!("ignoring {path}");
                continue;
            };
            if let Some(file) = self.stat_remote(serial, &path).await? {
                binaries.push(InstalledBinary::from_remote(file, &version, arch));
            }
        }

        binaries.sort_by(|a, b| version_key(&b.version).cmp(&version_key(&a.version)));
        Ok(binaries)
    }

    /// Removes the binary for `version`; falls back to `su` when the shell
    /// user cannot delete it.
    pub async fn uninstall(
        &self,
        device: &DeviceHandle,
        version: &str,
        custom_dir: Option<&str>,
    ) -> Result<InstalledBinary> {
        let serial = device.serial.as_str();
        let version = normalize_version(version);
        let arch = self.detect_architecture(device).await?;
        let path = join_remote(self.server_dir(custom_dir), &server_file_name(version, arch));
        let Some(file) = self.stat_remote(serial, &path).await? else {
            return Err(ProvisionError::NotInstalled {
                version: version.to_string(),
                path,
            });
        };
        let removed = InstalledBinary::from_remote(file, version, arch);
        self.remove_installed(device, &removed).await?;
        Ok(removed)
    }

    /// Removes a binary by the path `list_installed` reported, whatever its
    /// architecture.
    pub async fn remove_installed(
        &self,
        device: &DeviceHandle,
        binary: &InstalledBinary,
    ) -> Result<()> {
        self.remove_remote(&device.serial, &binary.path).await?;
        info!("Removed {}", binary.path);
        Ok(())
    }
}
