use std::{fmt, time::Duration};

use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::ids::{same_serial, ConnectionKind};
use crate::parse::parse_devices;
use crate::provisioner::Provisioner;

/// Connection state column of `adb devices`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Ready,
    Unauthorized,
    Offline,
    Recovery,
    Bootloader,
    Other(String),
}

impl DeviceState {
    pub fn from_adb(state: &str) -> Self {
        match state {
            "device" => DeviceState::Ready,
            "unauthorized" => DeviceState::Unauthorized,
            "offline" => DeviceState::Offline,
            "recovery" => DeviceState::Recovery,
            "bootloader" => DeviceState::Bootloader,
            other => DeviceState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceState::Ready => "device",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Offline => "offline",
            DeviceState::Recovery => "recovery",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Other(state) => state,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    pub serial: String,
    pub state: DeviceState,
    pub kind: ConnectionKind,
    pub model: Option<String>,
    pub product: Option<String>,
    pub transport_id: Option<String>,
}

impl DeviceHandle {
    pub fn is_authorized(&self) -> bool {
        self.state == DeviceState::Ready
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) - {}",
            self.serial,
            self.model.as_deref().unwrap_or("unknown model"),
            self.state
        )
    }
}

impl Provisioner {
    /// Every device adb reports, in adb's order, whatever its state.
    /// An empty list is a valid answer, not an error.
    pub async fn list_devices(&self) -> Result<Vec<DeviceHandle>> {
        let raw = self.bridge().devices().await?;
        Ok(parse_devices(&raw))
    }

    /// Picks the device to operate on. An explicit serial must match a
    /// listed device exactly; otherwise the sole authorized device wins.
    pub async fn select_device(&self, serial: Option<&str>) -> Result<DeviceHandle> {
        let devices = self.list_devices().await?;
        let serial = serial
            .map(str::to_string)
            .or_else(|| self.config().default_device.clone());
        pick_device(devices, serial.as_deref())
    }

    /// Polls the listing until an authorized device (or the given one)
    /// shows up.
    pub async fn wait_for_device(
        &self,
        serial: Option<&str>,
        timeout: Duration,
    ) -> Result<DeviceHandle> {
        let interval = Duration::from_secs(1).min(timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.select_device(serial).await {
                Ok(device) => return Ok(device),
                Err(
                    err @ (ProvisionError::NoDevice
                    | ProvisionError::DeviceNotFound { .. }
                    | ProvisionError::DeviceUnauthorized { .. }),
                ) => {
                    if tokio::time::Instant::now() + interval > deadline {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(interval).await;
        }
    }
}

pub(crate) fn pick_device(devices: Vec<DeviceHandle>, serial: Option<&str>) -> Result<DeviceHandle> {
    if let Some(serial) = serial {
        let Some(device) = devices.into_iter().find(|d| same_serial(&d.serial, serial)) else {
            return Err(ProvisionError::DeviceNotFound {
                serial: serial.to_string(),
            });
        };
        if !device.is_authorized() {
            return Err(ProvisionError::DeviceUnauthorized {
                serial: device.serial,
                state: device.state.to_string(),
            });
        }
        info!("Using device {device}");
        return Ok(device);
    }

    let pending = devices.iter().filter(|d| !d.is_authorized()).count();
    let mut ready: Vec<DeviceHandle> = devices.into_iter().filter(|d| d.is_authorized()).collect();
    match ready.len() {
        0 => {
            if pending > 0 {
                warn!("{pending} device(s) attached but not authorized");
            }
            Err(ProvisionError::NoDevice)
        }
        1 => {
            let device = ready.remove(0);
            info!("Using device {device}");
            Ok(device)
        }
        _ => Err(ProvisionError::AmbiguousDevice {
            serials: ready.into_iter().map(|d| d.serial).collect(),
        }),
    }
}
