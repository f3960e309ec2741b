use std::{fmt, str::FromStr, time::Duration};

use tracing::{debug, info};

use crate::device::DeviceHandle;
use crate::error::{ProvisionError, Result};
use crate::parse::{parse_getprop, reports_root_uid};
use crate::provisioner::Provisioner;

const PROP_TIMEOUT: Duration = Duration::from_secs(2);

/// CPU architectures frida-server is published for on Android.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    Arm64,
    Arm,
    X86_64,
    X86,
}

/// Raw `ro.product.cpu.abi` / `uname -m` spellings and what they map to.
/// Lookup is exact; anything missing here is unsupported.
const ARCH_TABLE: &[(&str, Arch)] = &[
    ("arm64-v8a", Arch::Arm64),
    ("arm64", Arch::Arm64),
    ("aarch64", Arch::Arm64),
    ("armeabi-v7a", Arch::Arm),
    ("armeabi", Arch::Arm),
    ("armv7l", Arch::Arm),
    ("armv8l", Arch::Arm),
    ("arm", Arch::Arm),
    ("x86_64", Arch::X86_64),
    ("amd64", Arch::X86_64),
    ("x86", Arch::X86),
    ("i686", Arch::X86),
    ("i386", Arch::X86),
];

impl Arch {
    pub const ALL: [Arch; 4] = [Arch::Arm64, Arch::Arm, Arch::X86_64, Arch::X86];

    pub fn from_raw(raw: &str) -> Result<Arch> {
        let key = raw.trim().to_ascii_lowercase();
        ARCH_TABLE
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, arch)| *arch)
            .ok_or_else(|| ProvisionError::UnsupportedArchitecture {
                raw: raw.trim().to_string(),
            })
    }

    /// The architecture suffix used in release asset names.
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::X86_64 => "x86_64",
            Arch::X86 => "x86",
        }
    }

    /// Catalog key, e.g. `android-arm64`.
    pub fn target(self) -> String {
        format!("android-{}", self.as_str())
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        Arch::from_raw(s)
    }
}

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub android_release: Option<String>,
    pub sdk_level: Option<String>,
    pub raw_abi: Option<String>,
    pub arch: Option<Arch>,
    pub rooted: bool,
}

impl Provisioner {
    /// Asks for an elevated `id`. Any failure, including a missing `su`, a
    /// denied prompt or a timeout, reads as "not rooted".
    pub async fn check_root(&self, device: &DeviceHandle) -> bool {
        match self.bridge().shell(&device.serial, "id", true).await {
            Ok(output) => {
                let rooted = output.success() && reports_root_uid(&output.stdout);
                debug!(serial = %device.serial, rooted, "root probe");
                rooted
            }
            Err(err) => {
                debug!(serial = %device.serial, "root probe failed: {err}");
                false
            }
        }
    }

    pub async fn require_root(&self, device: &DeviceHandle) -> Result<()> {
        if self.check_root(device).await {
            Ok(())
        } else {
            Err(ProvisionError::NotRooted {
                serial: device.serial.clone(),
            })
        }
    }

    pub async fn detect_architecture(&self, device: &DeviceHandle) -> Result<Arch> {
        let raw = self
            .getprop(&device.serial, "ro.product.cpu.abi")
            .await?
            .unwrap_or_default();
        let arch = Arch::from_raw(&raw)?;
        info!(serial = %device.serial, abi = %raw, "device architecture is {arch}");
        Ok(arch)
    }

    pub async fn device_info(&self, device: &DeviceHandle) -> Result<DeviceInfo> {
        let serial = device.serial.as_str();
        let raw_abi = self.getprop_quick(serial, "ro.product.cpu.abi").await;
        let arch = raw_abi.as_deref().and_then(|raw| Arch::from_raw(raw).ok());
        Ok(DeviceInfo {
            serial: serial.to_string(),
            model: match self.getprop_quick(serial, "ro.product.model").await {
                Some(model) => Some(model),
                None => device.model.clone(),
            },
            manufacturer: self.getprop_quick(serial, "ro.product.manufacturer").await,
            android_release: self.getprop_quick(serial, "ro.build.version.release").await,
            sdk_level: self.getprop_quick(serial, "ro.build.version.sdk").await,
            raw_abi,
            arch,
            rooted: self.check_root(device).await,
        })
    }

    pub(crate) async fn getprop(&self, serial: &str, prop: &str) -> Result<Option<String>> {
        let command = format!("getprop {prop}");
        let output = self.bridge().shell(serial, &command, false).await?;
        if !output.success() {
            return Err(ProvisionError::BridgeCommand {
                step: "getprop",
                command,
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(parse_getprop(&output.stdout))
    }

    async fn getprop_quick(&self, serial: &str, prop: &str) -> Option<String> {
        match tokio::time::timeout(PROP_TIMEOUT, self.getprop(serial, prop)).await {
            Ok(Ok(value)) => value,
            _ => None,
        }
    }
}
