use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Coarse error class, used by front-ends to pick an exit code and a hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A host tool is missing or cannot be spawned.
    Environment,
    /// Something about the attached device needs operator action.
    DeviceState,
    /// Catalog lookup or download failed.
    Network,
    /// A downloaded artifact could not be decoded.
    Data,
    ProtocolMismatch,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Recoverable,
    Unrecoverable,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("adb not found at `{path}` (set FPROV_ADB_PATH or ANDROID_SDK_ROOT)")]
    BridgeUnavailable { path: String },

    #[error("adb could not be run (`{command}`): {message}")]
    BridgeIo { command: String, message: String },

    #[error("{step}: `{command}` failed with exit {status}{}", format_detail(.stdout, .stderr))]
    BridgeCommand {
        step: &'static str,
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("decompressor `{tool}` not found (install xz-utils or set FPROV_XZ_PATH)")]
    DecompressorUnavailable { tool: String },

    #[error("`{tool}` is not available: {message}")]
    ToolUnavailable { tool: String, message: String },

    #[error("`{command}` failed with exit {status}{}", format_detail("", .stderr))]
    LocalToolFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("no authorized device connected; connect a device and accept the USB debugging prompt")]
    NoDevice,

    #[error("device {serial} not found among attached devices")]
    DeviceNotFound { serial: String },

    #[error("multiple devices connected ({}); pass --device <serial>", .serials.join(", "))]
    AmbiguousDevice { serials: Vec<String> },

    #[error("device {serial} is {state}; authorize it on the device and retry")]
    DeviceUnauthorized { serial: String, state: String },

    #[error("device {serial} has no root access (`su -c id` did not report uid 0)")]
    NotRooted { serial: String },

    #[error("unsupported CPU architecture `{raw}`")]
    UnsupportedArchitecture { raw: String },

    #[error("frida-server {version} is not installed at {path}")]
    NotInstalled { version: String, path: String },

    #[error("release catalog lookup failed: {0}")]
    CatalogError(String),

    #[error("no release {version} for {target} in the catalog")]
    ReleaseNotFound { version: String, target: String },

    #[error("download of {url} failed: {message}")]
    DownloadError { url: String, message: String },

    #[error("extracting {path} failed: {message}")]
    ExtractionError { path: String, message: String },

    #[error("pushing {local} to {remote} failed: {message}")]
    PushError {
        local: String,
        remote: String,
        message: String,
    },

    #[error("server version {server} does not match client version {client}")]
    ProtocolMismatch { server: String, client: String },

    #[error("`{command}` did not finish within {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("frida-server at {path} did not start listening on port {port} ({detail})")]
    StartTimeout {
        path: String,
        port: u16,
        detail: String,
    },

    #[error("port {port} on the device is already in use{}", format_holders(.holders))]
    PortInUse { port: u16, holders: Vec<u32> },

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BridgeUnavailable { .. }
            | Self::BridgeIo { .. }
            | Self::DecompressorUnavailable { .. }
            | Self::ToolUnavailable { .. }
            | Self::LocalToolFailed { .. }
            | Self::Io { .. } => ErrorCategory::Environment,
            Self::BridgeCommand { .. }
            | Self::NoDevice
            | Self::DeviceNotFound { .. }
            | Self::AmbiguousDevice { .. }
            | Self::DeviceUnauthorized { .. }
            | Self::NotRooted { .. }
            | Self::UnsupportedArchitecture { .. }
            | Self::NotInstalled { .. }
            | Self::PushError { .. }
            | Self::PortInUse { .. } => ErrorCategory::DeviceState,
            Self::CatalogError(_) | Self::ReleaseNotFound { .. } | Self::DownloadError { .. } => {
                ErrorCategory::Network
            }
            Self::ExtractionError { .. } => ErrorCategory::Data,
            Self::ProtocolMismatch { .. } => ErrorCategory::ProtocolMismatch,
            Self::Timeout { .. } | Self::StartTimeout { .. } | Self::Cancelled(_) => {
                ErrorCategory::Timeout
            }
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self.category() {
            ErrorCategory::Environment => Outcome::Unrecoverable,
            _ => Outcome::Recoverable,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

fn format_holders(pids: &[u32]) -> String {
    if pids.is_empty() {
        return String::new();
    }
    let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
    format!(" by frida-server (pids {}); stop it first", pids.join(", "))
}

fn format_detail(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let mut out = String::new();
    if !stdout.is_empty() {
        out.push_str("\nstdout: ");
        out.push_str(stdout);
    }
    if !stderr.is_empty() {
        out.push_str("\nstderr: ");
        out.push_str(stderr);
    }
    out
}
