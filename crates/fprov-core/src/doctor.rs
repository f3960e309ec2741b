use std::fmt;

use tracing::debug;

use crate::compat::CompatStatus;
use crate::config::DEFAULT_PORT;
use crate::device::DeviceHandle;
use crate::parse::parse_selinux_mode;
use crate::provisioner::Provisioner;
use crate::server::ServerStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
    Skipped,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warning => "warning",
            CheckStatus::Error => "error",
            CheckStatus::Skipped => "skipped",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    pub fix: Option<String>,
}

impl CheckResult {
    fn ok(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Ok,
            message: message.into(),
            fix: None,
        }
    }

    fn warning(name: &'static str, message: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warning,
            message: message.into(),
            fix: Some(fix.into()),
        }
    }

    fn error(name: &'static str, message: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Error,
            message: message.into(),
            fix: Some(fix.into()),
        }
    }

    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            message: "no device available".into(),
            fix: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    pub fn has_errors(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Error)
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn get(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

impl Provisioner {
    /// Runs every health check. Checks never fail the run; problems are
    /// reported as results, and device checks are skipped without a device.
    pub async fn doctor(&self, serial: Option<&str>) -> DoctorReport {
        let mut report = DoctorReport::default();

        report.checks.push(match self.bridge().version().await {
            Ok(version) => CheckResult::ok("adb", version),
            Err(err) => CheckResult::error(
                "adb",
                err.to_string(),
                "install Android platform-tools or set FPROV_ADB_PATH",
            ),
        });

        let xz = self.decompressor().tool();
        report.checks.push(if self.decompressor().available() {
            CheckResult::ok("xz", format!("{xz} found"))
        } else {
            CheckResult::error(
                "xz",
                format!("{xz} not found"),
                "install xz-utils (apt install xz-utils / brew install xz) or set FPROV_XZ_PATH",
            )
        });

        let device = match self.select_device(serial).await {
            Ok(device) => {
                report
                    .checks
                    .push(CheckResult::ok("device", device.to_string()));
                Some(device)
            }
            Err(err) => {
                report.checks.push(CheckResult::error(
                    "device",
                    err.to_string(),
                    "connect a device with USB debugging enabled and accept the prompt",
                ));
                None
            }
        };

        match device {
            Some(device) => self.device_checks(&device, &mut report).await,
            None => {
                for name in ["root", "architecture", "selinux", "frida-server"] {
                    report.checks.push(CheckResult::skipped(name));
                }
            }
        }

        report.checks.push(self.client_check().await);
        report
    }

    async fn device_checks(&self, device: &DeviceHandle, report: &mut DoctorReport) {
        report.checks.push(if self.check_root(device).await {
            CheckResult::ok("root", "su grants uid 0")
        } else {
            CheckResult::error(
                "root",
                "no root access",
                "root the device (e.g. Magisk) and allow shell in the su manager",
            )
        });

        report.checks.push(match self.detect_architecture(device).await {
            Ok(arch) => CheckResult::ok("architecture", arch.target()),
            Err(err) => CheckResult::error(
                "architecture",
                err.to_string(),
                "frida-server is published for arm, arm64, x86 and x86_64 only",
            ),
        });

        report.checks.push(match self.selinux_mode(&device.serial).await {
            Some(mode) if mode == "Enforcing" => CheckResult::warning(
                "selinux",
                "SELinux is Enforcing (may block frida)",
                "adb shell su -c 'setenforce 0'",
            ),
            Some(mode) => CheckResult::ok("selinux", format!("SELinux is {mode}")),
            None => CheckResult::ok("selinux", "SELinux mode unknown"),
        });

        let port = self.config().port;
        report.checks.push(match self.status(device, port).await {
            Ok(ServerStatus::Running {
                listening: true, ..
            }) => CheckResult::ok("frida-server", format!("running, listening on {port}")),
            Ok(ServerStatus::Running { .. }) => CheckResult::warning(
                "frida-server",
                format!("running but not listening on {port}"),
                "fprov restart",
            ),
            Ok(ServerStatus::NotRunning) => match self.list_installed(device, None).await {
                Ok(installed) if !installed.is_empty() => CheckResult::warning(
                    "frida-server",
                    format!("{} installed but not running", installed[0].version),
                    if port == DEFAULT_PORT {
                        "fprov start".to_string()
                    } else {
                        format!("fprov start --port {port}")
                    },
                ),
                _ => CheckResult::error("frida-server", "not installed", "fprov install"),
            },
            Err(err) => CheckResult::error("frida-server", err.to_string(), "fprov status -v"),
        });
    }

    async fn selinux_mode(&self, serial: &str) -> Option<String> {
        match self.bridge().shell(serial, "getenforce", false).await {
            Ok(output) => parse_selinux_mode(&output.stdout),
            Err(err) => {
                debug!("getenforce failed: {err}");
                None
            }
        }
    }

    async fn client_check(&self) -> CheckResult {
        match self.client_tooling().client_version().await {
            Ok(Some(version)) => CheckResult::ok("frida client", format!("frida {version}")),
            Ok(None) => CheckResult::warning(
                "frida client",
                "frida tools not installed on host",
                "pip install frida-tools",
            ),
            Err(err) => CheckResult::warning("frida client", err.to_string(), "pip install frida-tools"),
        }
    }
}

/// Maps a compatibility verdict onto a doctor status.
pub fn compat_check_status(status: CompatStatus) -> CheckStatus {
    match status {
        CompatStatus::Match => CheckStatus::Ok,
        CompatStatus::Compatible | CompatStatus::Unknown | CompatStatus::NotInstalled => {
            CheckStatus::Warning
        }
        CompatStatus::Mismatch => CheckStatus::Error,
    }
}
