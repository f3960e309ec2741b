//! In-memory stand-ins for adb, the release catalog, xz and the host frida
//! tooling. `FakeBridge` interprets exactly the device commands the
//! provisioner issues.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::watch,
};

use crate::artifacts::Decompressor;
use crate::bridge::{BridgeClient, ShellOutput};
use crate::capability::Arch;
use crate::catalog::{ReleaseCatalog, ServerRelease};
use crate::compat::ClientTooling;
use crate::config::DEFAULT_PORT;
use crate::device::{DeviceHandle, DeviceState};
use crate::error::{ProvisionError, Result};
use crate::hashing::sha256_bytes;
use crate::ids::classify_serial;

pub(crate) fn handle(serial: &str) -> DeviceHandle {
    DeviceHandle {
        serial: serial.to_string(),
        state: DeviceState::Ready,
        kind: classify_serial(serial),
        model: None,
        product: None,
        transport_id: None,
    }
}

#[derive(Clone, Debug)]
struct FakeFile {
    data: Vec<u8>,
    mode: u32,
}

#[derive(Clone, Debug)]
struct FakeProcess {
    pid: u32,
    command: String,
    port: Option<u16>,
}

#[derive(Clone, Debug)]
pub(crate) struct FakeDevice {
    serial: String,
    state: String,
    rooted: bool,
    props: BTreeMap<String, String>,
    files: BTreeMap<String, FakeFile>,
    processes: Vec<FakeProcess>,
    next_pid: u32,
    selinux: String,
    has_sha256sum: bool,
    corrupt_push: bool,
    fail_push: bool,
    server_listens: bool,
}

impl FakeDevice {
    pub(crate) fn rooted(serial: &str, abi: &str) -> Self {
        let mut props = BTreeMap::new();
        props.insert("ro.product.cpu.abi".to_string(), abi.to_string());
        Self {
            serial: serial.to_string(),
            state: "device".into(),
            rooted: true,
            props,
            files: BTreeMap::new(),
            processes: Vec::new(),
            next_pid: 10_000,
            selinux: "Enforcing".into(),
            has_sha256sum: true,
            corrupt_push: false,
            fail_push: false,
            server_listens: true,
        }
    }

    pub(crate) fn unrooted(serial: &str, abi: &str) -> Self {
        Self {
            rooted: false,
            ..Self::rooted(serial, abi)
        }
    }

    pub(crate) fn unauthorized(mut self) -> Self {
        self.state = "unauthorized".into();
        self
    }

    pub(crate) fn with_prop(mut self, key: &str, value: &str) -> Self {
        self.props.insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn with_file(mut self, path: &str, data: &[u8], mode: u32) -> Self {
        self.files.insert(
            path.to_string(),
            FakeFile {
                data: data.to_vec(),
                mode,
            },
        );
        self
    }

    pub(crate) fn with_process(mut self, pid: u32, command: &str) -> Self {
        self.processes.push(FakeProcess {
            pid,
            command: command.to_string(),
            port: None,
        });
        self
    }

    pub(crate) fn with_listening_process(mut self, pid: u32, command: &str, port: u16) -> Self {
        self.processes.push(FakeProcess {
            pid,
            command: command.to_string(),
            port: Some(port),
        });
        self
    }

    pub(crate) fn with_selinux(mut self, mode: &str) -> Self {
        self.selinux = mode.to_string();
        self
    }

    pub(crate) fn without_sha256sum(mut self) -> Self {
        self.has_sha256sum = false;
        self
    }

    pub(crate) fn corrupting_push(mut self) -> Self {
        self.corrupt_push = true;
        self
    }

    pub(crate) fn failing_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub(crate) fn server_never_listens(mut self) -> Self {
        self.server_listens = false;
        self
    }

    fn ls_long(&self, path: &str) -> ShellOutput {
        match self.files.get(path) {
            Some(file) => ok(format!(
                "{} 1 shell shell {} 2024-03-01 10:00 {path}\n",
                mode_string(file.mode),
                file.data.len()
            )),
            None => fail(1, format!("ls: {path}: No such file or directory\n")),
        }
    }

    fn ls_glob(&self, pattern: &str) -> ShellOutput {
        let prefix = pattern.trim_end_matches('*');
        let matches: Vec<&String> = self.files.keys().filter(|p| p.starts_with(prefix)).collect();
        if matches.is_empty() {
            return fail(1, format!("ls: {pattern}: No such file or directory\n"));
        }
        ok(matches.iter().map(|p| format!("{p}\n")).collect())
    }

    fn ps(&self) -> ShellOutput {
        let mut out = String::from("  PID ARGS\n");
        out.push_str("    1 /system/bin/init second_stage\n");
        for process in &self.processes {
            out.push_str(&format!("{:>5} {}\n", process.pid, process.command));
        }
        ok(out)
    }

    fn tcp_table(&self) -> ShellOutput {
        let mut out = String::from(
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n",
        );
        for (slot, port) in self.processes.iter().filter_map(|p| p.port).enumerate() {
            out.push_str(&format!(
                "{slot:>4}: 00000000:{port:04X} 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1\n"
            ));
        }
        ok(out)
    }

    fn launch(&mut self, command: &str) -> ShellOutput {
        let rest = command.trim_start_matches("nohup ").trim();
        let Some(rest) = rest.strip_prefix('\'') else {
            return fail(1, "unexpected launch syntax\n".into());
        };
        let Some((path, args)) = rest.split_once('\'') else {
            return fail(1, "unexpected launch syntax\n".into());
        };
        let args = args
            .split(">/dev/null")
            .next()
            .unwrap_or_default()
            .trim();
        let port = args
            .strip_prefix("-l 0.0.0.0:")
            .and_then(|port| port.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        // nohup detaches; a missing binary still returns 0 to the caller.
        let runnable = self
            .files
            .get(path)
            .is_some_and(|file| file.mode & 0o100 != 0 && !file.data.is_empty());
        if runnable {
            self.next_pid += 1;
            let command = if args.is_empty() {
                path.to_string()
            } else {
                format!("{path} {args}")
            };
            self.processes.push(FakeProcess {
                pid: self.next_pid,
                command,
                port: self.server_listens.then_some(port),
            });
        }
        ok(String::new())
    }

    fn kill(&mut self, pid: &str) -> ShellOutput {
        let Ok(pid) = pid.parse::<u32>() else {
            return fail(1, format!("kill: {pid}: bad pid\n"));
        };
        let before = self.processes.len();
        self.processes.retain(|p| p.pid != pid);
        if self.processes.len() == before {
            fail(1, format!("kill: {pid}: No such process\n"))
        } else {
            ok(String::new())
        }
    }

    fn run(&mut self, command: &str, elevated: bool) -> ShellOutput {
        let (program, args) = command.split_once(' ').unwrap_or((command, ""));
        let arg = unquote(args);
        match program {
            "id" if elevated => ok("uid=0(root) gid=0(root) context=u:r:su:s0\n".into()),
            "id" => ok("uid=2000(shell) gid=2000(shell) groups=2000(shell)\n".into()),
            "getprop" => ok(format!("{}\n", self.props.get(args).cloned().unwrap_or_default())),
            "getenforce" => ok(format!("{}\n", self.selinux)),
            "ls" if args.starts_with("-l ") => self.ls_long(&unquote(&args[3..])),
            "ls" if args.starts_with("-1 ") => self.ls_glob(&args[3..].replace('\'', "")),
            "chmod" => {
                let path = unquote(args.trim_start_matches("755 "));
                match self.files.get_mut(&path) {
                    Some(file) => {
                        file.mode = 0o755;
                        ok(String::new())
                    }
                    None => fail(1, format!("chmod: {path}: No such file or directory\n")),
                }
            }
            "mv" => {
                let words: Vec<String> = args
                    .trim_start_matches("-f ")
                    .split_whitespace()
                    .map(unquote)
                    .collect();
                let [from, to] = words.as_slice() else {
                    return fail(1, "mv: bad arguments\n".into());
                };
                match self.files.remove(from) {
                    Some(file) => {
                        self.files.insert(to.clone(), file);
                        ok(String::new())
                    }
                    None => fail(1, format!("mv: {from}: No such file or directory\n")),
                }
            }
            "rm" => {
                self.files.remove(&unquote(args.trim_start_matches("-f ")));
                ok(String::new())
            }
            "sha256sum" if self.has_sha256sum => match self.files.get(&arg) {
                Some(file) => ok(format!("{}  {arg}\n", sha256_bytes(&file.data))),
                None => fail(1, format!("sha256sum: {arg}: No such file or directory\n")),
            },
            "ps" if args == "-A -o PID,ARGS" => self.ps(),
            "cat" if args.starts_with("/proc/net/tcp") => self.tcp_table(),
            "nohup" => self.launch(command),
            "kill" => self.kill(args.trim_start_matches("-9 ")),
            _ => fail(127, format!("/system/bin/sh: {program}: inaccessible or not found\n")),
        }
    }
}

/// Strips one level of the single quoting produced by `shell_quote`.
fn unquote(word: &str) -> String {
    let word = word.trim();
    match word.strip_prefix('\'').and_then(|w| w.strip_suffix('\'')) {
        Some(inner) => inner.replace(r"'\''", "'"),
        None => word.to_string(),
    }
}

fn mode_string(mode: u32) -> String {
    let mut out = String::from("-");
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn ok(stdout: String) -> ShellOutput {
    ShellOutput {
        status: 0,
        stdout,
        stderr: String::new(),
    }
}

fn fail(status: i32, stderr: String) -> ShellOutput {
    ShellOutput {
        status,
        stdout: String::new(),
        stderr,
    }
}

#[derive(Default)]
struct BridgeState {
    devices: Vec<FakeDevice>,
    pushes: usize,
    forwards: Vec<(String, u16, u16)>,
}

/// Cloneable handle onto one shared fake device set.
#[derive(Clone)]
pub(crate) struct FakeBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl FakeBridge {
    pub(crate) fn new(devices: Vec<FakeDevice>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BridgeState {
                devices,
                ..BridgeState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn push_count(&self) -> usize {
        self.lock().pushes
    }

    pub(crate) fn forwards(&self) -> Vec<(String, u16, u16)> {
        self.lock().forwards.clone()
    }

    pub(crate) fn file(&self, serial: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let device = state.devices.iter().find(|d| d.serial == serial)?;
        device.files.get(path).map(|f| f.data.clone())
    }
}

fn device_missing(serial: &str) -> ShellOutput {
    fail(1, format!("adb: device '{serial}' not found\n"))
}

#[async_trait]
impl BridgeClient for FakeBridge {
    async fn version(&self) -> Result<String> {
        Ok("Android Debug Bridge version 1.0.41".into())
    }

    async fn devices(&self) -> Result<String> {
        let state = self.lock();
        let mut out = String::from("List of devices attached\n");
        for (idx, device) in state.devices.iter().enumerate() {
            out.push_str(&format!(
                "{}\t{} product:fake model:Fake_{} transport_id:{}\n",
                device.serial,
                device.state,
                device.serial,
                idx + 1
            ));
        }
        Ok(out)
    }

    async fn shell(&self, serial: &str, command: &str, elevated: bool) -> Result<ShellOutput> {
        let mut state = self.lock();
        let Some(device) = state.devices.iter_mut().find(|d| d.serial == serial) else {
            return Ok(device_missing(serial));
        };
        if device.state != "device" {
            return Ok(fail(1, format!("adb: device {} is {}\n", serial, device.state)));
        }
        if elevated && !device.rooted {
            return Ok(fail(127, "/system/bin/sh: su: inaccessible or not found\n".into()));
        }
        Ok(device.run(command, elevated))
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        let data = fs::read(local).map_err(|e| ProvisionError::io("fake push", e))?;
        let mut state = self.lock();
        state.pushes += 1;
        let command = format!("adb -s {serial} push {} {remote}", local.display());
        let Some(device) = state.devices.iter_mut().find(|d| d.serial == serial) else {
            return Err(ProvisionError::BridgeCommand {
                step: "push",
                command,
                status: 1,
                stdout: String::new(),
                stderr: format!("adb: device '{serial}' not found"),
            });
        };
        if device.fail_push {
            // adb leaves whatever it managed to write
            let partial = data[..data.len() / 2].to_vec();
            device.files.insert(
                remote.to_string(),
                FakeFile {
                    data: partial,
                    mode: 0o644,
                },
            );
            return Err(ProvisionError::BridgeCommand {
                step: "push",
                command,
                status: 1,
                stdout: String::new(),
                stderr: format!("adb: error: failed to copy '{}' to '{remote}': remote No space left on device", local.display()),
            });
        }
        let mut data = data;
        if device.corrupt_push {
            if let Some(byte) = data.last_mut() {
                *byte ^= 0xff;
            }
        }
        device
            .files
            .insert(remote.to_string(), FakeFile { data, mode: 0o644 });
        Ok(())
    }

    async fn forward(&self, serial: &str, local_port: u16, remote_port: u16) -> Result<()> {
        self.lock()
            .forwards
            .push((serial.to_string(), local_port, remote_port));
        Ok(())
    }
}

/// Catalog that counts lookups and knows no releases.
#[derive(Default)]
pub(crate) struct CountingCatalog {
    calls: AtomicUsize,
}

impl CountingCatalog {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseCatalog for CountingCatalog {
    async fn latest_version(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProvisionError::CatalogError("counting catalog is empty".into()))
    }

    async fn release(&self, version: &str, arch: Arch) -> Result<ServerRelease> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProvisionError::ReleaseNotFound {
            version: version.to_string(),
            target: arch.target(),
        })
    }

    async fn versions(&self, _limit: usize) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// "Decompresses" by copying `x.xz` to `x`.
#[derive(Default)]
pub(crate) struct CopyDecompressor {
    calls: AtomicUsize,
}

impl CopyDecompressor {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Decompressor for CopyDecompressor {
    fn tool(&self) -> String {
        "copy".into()
    }

    fn available(&self) -> bool {
        true
    }

    async fn decompress(
        &self,
        archive: &Path,
        _cancel_rx: Option<watch::Receiver<bool>>,
    ) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = archive.with_extension("");
        fs::copy(archive, &output).map_err(|e| ProvisionError::ExtractionError {
            path: archive.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(output)
    }
}

#[derive(Default)]
pub(crate) struct FakeClientTooling {
    version: Option<String>,
    installs: Mutex<Vec<String>>,
}

impl FakeClientTooling {
    pub(crate) fn with_version(version: &str) -> Self {
        Self {
            version: Some(version.to_string()),
            installs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn installs(&self) -> Vec<String> {
        self.installs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientTooling for FakeClientTooling {
    async fn client_version(&self) -> Result<Option<String>> {
        Ok(self.version.clone())
    }

    async fn install_client(&self, version: &str) -> Result<()> {
        self.installs.lock().unwrap().push(version.to_string());
        Ok(())
    }
}

/// Serves one canned HTTP response per connection on a loopback port and
/// returns a URL pointing at it. `content_length` may overstate the body to
/// simulate a dropped connection.
pub(crate) async fn serve_http(status: &str, content_length: Option<usize>, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let status = status.to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;
            let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
            if let Some(len) = content_length {
                head.push_str(&format!("Content-Length: {len}\r\n"));
            }
            head.push_str("\r\n");
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}/frida-server.xz")
}

/// Answers `GET <path>` with `200` and the matching JSON body, anything else
/// with `404`. Returns the base URL.
pub(crate) async fn serve_routes(routes: Vec<(&'static str, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = vec![0u8; 4096];
            let read = socket.read(&mut request).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&request[..read]);
            let path = request.split_whitespace().nth(1).unwrap_or_default();
            let (status, body) = match routes.iter().find(|(route, _)| *route == path) {
                Some((_, body)) => ("200 OK", body.clone()),
                None => ("404 Not Found", r#"{"message":"Not Found"}"#.to_string()),
            };
            let head = format!(
                "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(body.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}")
}
