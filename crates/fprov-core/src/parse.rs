//! Scrapers for device command output. Each function owns one output
//! format; format drift in adb or toybox should only ever touch this file.

use crate::capability::Arch;
use crate::device::{DeviceHandle, DeviceState};
use crate::ids::classify_serial;

/// `adb devices -l`:
///
/// ```text
/// List of devices attached
/// <serial> <state> [key:value ...]
/// ```
///
/// Lines starting with `*` are daemon chatter (`* daemon started *`).
pub(crate) fn parse_devices(output: &str) -> Vec<DeviceHandle> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices attached") || line.starts_with('*')
        {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };
        // `no permissions (...)` spans several words; keep the first one.
        let state = if state == "no" { "no permissions" } else { state };

        let mut model = None;
        let mut product = None;
        let mut transport_id = None;
        for part in parts {
            if let Some((key, value)) = part.split_once(':') {
                match key {
                    "model" => model = Some(value.to_string()),
                    "product" => product = Some(value.to_string()),
                    "transport_id" => transport_id = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        devices.push(DeviceHandle {
            serial: serial.to_string(),
            state: DeviceState::from_adb(state),
            kind: classify_serial(serial),
            model,
            product,
            transport_id,
        });
    }

    devices
}

/// Trimmed `getprop <name>` value; an unset property prints an empty line.
pub(crate) fn parse_getprop(output: &str) -> Option<String> {
    let value = output.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// `id` output such as `uid=0(root) gid=0(root) groups=...`.
pub(crate) fn reports_root_uid(output: &str) -> bool {
    output
        .split_whitespace()
        .any(|field| field == "uid=0" || field.starts_with("uid=0("))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ProcessEntry {
    pub(crate) pid: u32,
    pub(crate) command: String,
}

impl ProcessEntry {
    /// Executable path (first word of the command line).
    pub(crate) fn executable(&self) -> &str {
        self.command.split_whitespace().next().unwrap_or_default()
    }

    pub(crate) fn executable_name(&self) -> &str {
        let exe = self.executable();
        exe.rsplit('/').next().unwrap_or(exe)
    }
}

/// Process listing. Two grammars are accepted:
///
/// * toybox `ps -A -o PID,ARGS`: header `PID ARGS`, then `<pid> <argv...>`;
/// * legacy toolbox `ps`: header `USER PID PPID ... NAME`, pid in the `PID`
///   column and the process name in the last field.
pub(crate) fn parse_processes(output: &str) -> Vec<ProcessEntry> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split_whitespace().collect();
    let Some(pid_col) = columns.iter().position(|c| *c == "PID") else {
        return Vec::new();
    };
    let args_format = columns == ["PID", "ARGS"];

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if args_format {
                let pid = fields.first()?.parse().ok()?;
                let command = line.trim_start().split_once(char::is_whitespace)?.1.trim();
                Some(ProcessEntry {
                    pid,
                    command: command.to_string(),
                })
            } else {
                let pid = fields.get(pid_col)?.parse().ok()?;
                let command = fields.last()?.to_string();
                Some(ProcessEntry { pid, command })
            }
        })
        .collect()
}

/// Ports in LISTEN state (`st == 0A`) from `/proc/net/tcp` and
/// `/proc/net/tcp6`:
///
/// ```text
///   sl  local_address rem_address   st ...
///    0: 0100007F:69A2 00000000:0000 0A ...
/// ```
pub(crate) fn parse_listening_ports(output: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let slot = fields.next()?;
            if !slot.ends_with(':') {
                return None;
            }
            let local = fields.next()?;
            let _remote = fields.next()?;
            let state = fields.next()?;
            if !state.eq_ignore_ascii_case("0A") {
                return None;
            }
            let (_, port) = local.rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok()
        })
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RemoteFile {
    pub(crate) mode: String,
    pub(crate) size: u64,
    pub(crate) path: String,
}

impl RemoteFile {
    pub(crate) fn owner_executable(&self) -> bool {
        self.mode.as_bytes().get(3) == Some(&b'x')
    }
}

/// toybox `ls -l <path>`:
/// `-rwxr-xr-x 1 shell shell 54915736 2024-03-01 10:00 /data/local/tmp/x`.
/// Returns `None` for missing files and anything that is not a regular file.
pub(crate) fn parse_ls_long(output: &str) -> Option<RemoteFile> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('-'))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let size = fields.get(4)?.parse().ok()?;
    Some(RemoteFile {
        mode: fields[0].to_string(),
        size,
        path: fields.last()?.to_string(),
    })
}

/// First field of `sha256sum <path>`, if it is a 64-character hex digest.
pub(crate) fn parse_sha256sum(output: &str) -> Option<String> {
    let digest = output.split_whitespace().next()?;
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

/// Splits `frida-server-<version>-android-<arch>` into its parts.
pub(crate) fn parse_server_filename(name: &str) -> Option<(String, Arch)> {
    let rest = name.strip_prefix("frida-server-")?;
    let (version, arch) = rest.rsplit_once("-android-")?;
    if version.is_empty() {
        return None;
    }
    Some((version.to_string(), Arch::from_raw(arch).ok()?))
}

/// Paths printed by `ls -1 <dir>/frida-server-*`; shell errors for an
/// unmatched glob are dropped.
pub(crate) fn parse_path_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('/') && !line.contains(": "))
        .map(str::to_string)
        .collect()
}

/// `getenforce`: `Enforcing`, `Permissive` or `Disabled`.
pub(crate) fn parse_selinux_mode(output: &str) -> Option<String> {
    let mode = output.trim();
    match mode {
        "Enforcing" | "Permissive" | "Disabled" => Some(mode.to_string()),
        _ => None,
    }
}

/// `frida --version` prints a bare version such as `16.1.17`.
pub(crate) fn parse_tool_version(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let version = line.trim_start_matches('v');
    if version.chars().next()?.is_ascii_digit() {
        Some(version.split_whitespace().next()?.to_string())
    } else {
        None
    }
}
