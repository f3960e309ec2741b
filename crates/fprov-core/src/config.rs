use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use fprov_util::{env_flag, env_string, expand_user};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_PORT: u16 = 27042;
pub const DEFAULT_SERVER_DIR: &str = "/data/local/tmp";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_START_ATTEMPTS: u32 = 10;
pub const DEFAULT_START_POLL_MILLIS: u64 = 500;

/// Resolved, read-only settings for one run. Built once at the edge
/// (file, then environment, then defaults) and passed down by reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub adb_path: Option<PathBuf>,
    pub xz_path: Option<PathBuf>,
    pub default_device: Option<String>,
    pub default_version: Option<String>,
    pub port: u16,
    pub server_dir: String,
    pub download_dir: Option<PathBuf>,
    /// Local JSON catalog; GitHub releases are used when unset.
    pub catalog_path: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub start_attempts: u32,
    pub start_poll_millis: u64,
    pub strict_client_match: bool,
    pub keep_downloads: bool,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            adb_path: None,
            xz_path: None,
            default_device: None,
            default_version: None,
            port: DEFAULT_PORT,
            server_dir: DEFAULT_SERVER_DIR.to_string(),
            download_dir: None,
            catalog_path: None,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            start_attempts: DEFAULT_START_ATTEMPTS,
            start_poll_millis: DEFAULT_START_POLL_MILLIS,
            strict_client_match: false,
            keep_downloads: false,
        }
    }
}

impl ProvisionConfig {
    /// Loads the config file (explicit path, `FPROV_CONFIG`, or the default
    /// location) and applies environment overrides on top.
    pub fn load(path: Option<&Path>) -> Self {
        let path = Self::resolve_path(path);
        let mut cfg = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<ProvisionConfig>(&raw) {
                Ok(cfg) => {
                    debug!("Loaded config from {}", path.display());
                    cfg
                }
                Err(err) => {
                    warn!("Failed to parse {}: {err}", path.display());
                    ProvisionConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                ProvisionConfig::default()
            }
        };
        cfg.apply_env(env_string);
        cfg
    }

    /// Explicit path, then `FPROV_CONFIG`, then `~/.local/share/fprov/config.json`.
    pub fn resolve_path(path: Option<&Path>) -> PathBuf {
        path.map(Path::to_path_buf)
            .or_else(|| env_string("FPROV_CONFIG").map(|p| expand_user(&p)))
            .unwrap_or_else(fprov_util::config_file_path)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fprov_util::write_json_atomic(path, self)
    }

    pub(crate) fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("FPROV_ADB_PATH").or_else(|| lookup("ADB_PATH")) {
            self.adb_path = Some(expand_user(&path));
        }
        if let Some(path) = lookup("FPROV_XZ_PATH") {
            self.xz_path = Some(expand_user(&path));
        }
        if let Some(serial) = lookup("FPROV_DEFAULT_DEVICE").or_else(|| lookup("ANDROID_SERIAL")) {
            self.default_device = Some(serial);
        }
        if let Some(version) = lookup("FPROV_DEFAULT_VERSION") {
            self.default_version = Some(version.trim_start_matches('v').to_string());
        }
        if let Some(port) = lookup("FPROV_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!("Ignoring FPROV_PORT={port}: not a port number"),
            }
        }
        if let Some(dir) = lookup("FPROV_SERVER_DIR") {
            self.server_dir = dir.trim_end_matches('/').to_string();
        }
        if let Some(dir) = lookup("FPROV_DOWNLOAD_DIR") {
            self.download_dir = Some(expand_user(&dir));
        }
        if let Some(path) = lookup("FPROV_CATALOG") {
            self.catalog_path = Some(expand_user(&path));
        }
        if let Some(secs) = lookup("FPROV_COMMAND_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => self.command_timeout_secs = secs,
                Err(_) => warn!("Ignoring FPROV_COMMAND_TIMEOUT_SECS={secs}"),
            }
        }
        if let Some(value) = lookup("FPROV_STRICT_CLIENT_MATCH") {
            self.strict_client_match = fprov_util::parse_flag(&value);
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_millis)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(fprov_util::download_dir)
    }

    /// Resolves the adb executable: configured path, then the SDK
    /// platform-tools, then whatever `adb` is on PATH.
    pub fn adb_path(&self) -> PathBuf {
        if let Some(path) = self.adb_path.as_ref() {
            return path.clone();
        }
        if let Some(sdk_root) = env_string("ANDROID_SDK_ROOT").or_else(|| env_string("ANDROID_HOME"))
        {
            let tools = PathBuf::from(&sdk_root).join("platform-tools");
            for name in ["adb", "adb.exe"] {
                let candidate = tools.join(name);
                if candidate.exists() {
                    return candidate;
                }
            }
        }
        PathBuf::from("adb")
    }

    pub fn xz_path(&self) -> PathBuf {
        self.xz_path.clone().unwrap_or_else(|| PathBuf::from("xz"))
    }

    pub fn verbose_env() -> bool {
        env_flag("FPROV_VERBOSE").unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_frida_conventions() {
        let cfg = ProvisionConfig::default();
        assert_eq!(cfg.port, 27042);
        assert_eq!(cfg.server_dir, "/data/local/tmp");
        assert_eq!(cfg.command_timeout(), Duration::from_secs(30));
        assert!(!cfg.strict_client_match);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg: ProvisionConfig =
            serde_json::from_str(r#"{ "port": 1234, "default_device": "file-serial" }"#).unwrap();
        cfg.apply_env(lookup(&[
            ("FPROV_DEFAULT_DEVICE", "env-serial"),
            ("FPROV_DEFAULT_VERSION", "v16.1.17"),
            ("FPROV_SERVER_DIR", "/data/local/tmp/fs/"),
            ("FPROV_STRICT_CLIENT_MATCH", "yes"),
        ]));
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.default_device.as_deref(), Some("env-serial"));
        assert_eq!(cfg.default_version.as_deref(), Some("16.1.17"));
        assert_eq!(cfg.server_dir, "/data/local/tmp/fs");
        assert!(cfg.strict_client_match);
    }

    #[test]
    fn invalid_numeric_env_is_ignored() {
        let mut cfg = ProvisionConfig::default();
        cfg.apply_env(lookup(&[
            ("FPROV_PORT", "not-a-port"),
            ("FPROV_COMMAND_TIMEOUT_SECS", "-3"),
        ]));
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.command_timeout_secs, DEFAULT_COMMAND_TIMEOUT_SECS);
    }

    #[test]
    fn android_serial_is_a_device_fallback() {
        let mut cfg = ProvisionConfig::default();
        cfg.apply_env(lookup(&[("ANDROID_SERIAL", "emulator-5554")]));
        assert_eq!(cfg.default_device.as_deref(), Some("emulator-5554"));
    }

    #[test]
    fn save_then_load_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = ProvisionConfig {
            port: 31337,
            default_version: Some("16.0.1".into()),
            ..ProvisionConfig::default()
        };
        cfg.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let loaded: ProvisionConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.port, 31337);
        assert_eq!(loaded.default_version.as_deref(), Some("16.0.1"));
    }
}
