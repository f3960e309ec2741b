//! Provisioning of frida-server on Android devices over adb: device
//! selection, capability probes, download and push of the server binary,
//! and start/stop/status of the running server.

mod artifacts;
mod bridge;
mod cancel;
mod capability;
mod catalog;
mod compat;
mod config;
mod device;
mod doctor;
mod error;
mod hashing;
mod ids;
mod parse;
mod provision;
mod provisioner;
mod server;

#[cfg(test)]
mod testing;

pub use artifacts::{Decompressor, DownloadProgress, ProgressFn, XzDecompressor};
pub use bridge::{AdbBridge, BridgeClient, ShellOutput};
pub use capability::{Arch, DeviceInfo};
pub use catalog::{CatalogDocument, CatalogEntry, FileCatalog, GithubCatalog, ReleaseCatalog, ServerRelease};
pub use compat::{compare_versions, ClientTooling, CompatReport, CompatStatus, FridaTools};
pub use config::{
    ProvisionConfig, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_PORT, DEFAULT_SERVER_DIR,
    DEFAULT_START_ATTEMPTS, DEFAULT_START_POLL_MILLIS,
};
pub use device::{DeviceHandle, DeviceState};
pub use doctor::{compat_check_status, CheckResult, CheckStatus, DoctorReport};
pub use error::{ErrorCategory, Outcome, ProvisionError, Result};
pub use ids::ConnectionKind;
pub use provision::{server_file_name, InstalledBinary};
pub use provisioner::Provisioner;
pub use server::{RunningInstance, ServerStatus, StopReport};
