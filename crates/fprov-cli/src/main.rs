use std::{
    error::Error as _,
    io::{self, IsTerminal},
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Select};
use fprov_core::{
    compat_check_status, CheckStatus, DeviceHandle, DownloadProgress, InstalledBinary, Outcome,
    ProvisionConfig, ProvisionError, Provisioner, ServerStatus,
};
use fprov_util::format_bytes;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(
    name = "fprov",
    version,
    about = "Install, start and stop frida-server on Android devices over adb"
)]
struct Cli {
    /// Device serial (defaults to the only authorized device)
    #[arg(short = 's', long = "device", global = true)]
    device: Option<String>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Config file (defaults to $FPROV_CONFIG or ~/.local/share/fprov/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List attached devices
    Devices {
        /// Include unauthorized and offline devices
        #[arg(long)]
        all: bool,
        /// Probe architecture and root for each device
        #[arg(long)]
        detailed: bool,
    },
    /// Show model, Android version, ABI and root state
    Info,
    /// Show whether frida-server is running and listening
    Status {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Download and push frida-server (latest when VERSION is omitted)
    Install {
        version: Option<String>,
        /// Reinstall even if the binary is already present
        #[arg(long)]
        force: bool,
        /// Device directory for the binary
        #[arg(long)]
        dir: Option<String>,
    },
    /// Start frida-server, installing it first if needed
    Start {
        version: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Only start an already installed binary
        #[arg(long)]
        no_install: bool,
        /// Stop frida-server processes that hold the port
        #[arg(long)]
        replace: bool,
    },
    /// Kill frida-server processes
    Stop {
        /// Kill only this pid
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Stop and start again
    Restart {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Remove an installed binary (all of them when VERSION is omitted)
    Uninstall { version: Option<String> },
    /// List binaries installed on the device
    Installed,
    /// List published frida versions
    Versions {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Forward a host port to the server port
    Forward {
        #[arg(long)]
        local: Option<u16>,
        #[arg(long)]
        remote: Option<u16>,
    },
    /// Compare host frida client and device server versions
    Compat {
        /// Install the client version matching the server
        #[arg(long)]
        fix: bool,
    },
    /// Check the host and device setup
    Doctor,
    /// Wait for a device to come online
    Wait {
        /// Seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the resolved configuration
    Show,
    /// Write a config file with default values
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = fprov_util::init_tracing(cli.verbose || ProvisionConfig::verbose_env()) {
        eprintln!("failed to initialise logging: {err}");
    }
    let config = ProvisionConfig::load(cli.config.as_deref());

    match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            match err.outcome() {
                Outcome::Recoverable => ExitCode::from(1),
                Outcome::Unrecoverable => ExitCode::from(2),
            }
        }
    }
}

fn spawn_cancel_watcher() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling");
            let _ = tx.send(true);
        }
    });
    rx
}

fn progress_printer() -> fprov_core::ProgressFn {
    let last_percent = Arc::new(AtomicU64::new(u64::MAX));
    Arc::new(move |p: DownloadProgress| {
        let Some(total) = p.total.filter(|t| *t > 0) else {
            return;
        };
        let percent = p.downloaded * 100 / total;
        if last_percent.swap(percent, Ordering::Relaxed) == percent {
            return;
        }
        eprint!(
            "\rdownloading {} / {} ({percent}%)",
            format_bytes(p.downloaded),
            format_bytes(total)
        );
        if p.downloaded >= total {
            eprintln!();
        }
    })
}

async fn run(cli: Cli, config: ProvisionConfig) -> Result<ExitCode, ProvisionError> {
    if let Cmd::Config { cmd } = &cli.cmd {
        return config_command(cmd, cli.config.as_deref(), &config);
    }

    let port = config.port;
    let prov = Provisioner::new(config)?
        .with_cancel(spawn_cancel_watcher())
        .with_progress(progress_printer());
    let serial = cli.device.as_deref();

    match cli.cmd {
        Cmd::Devices { all, detailed } => {
            let devices = prov.list_devices().await?;
            let shown: Vec<&DeviceHandle> = devices
                .iter()
                .filter(|d| all || d.is_authorized())
                .collect();
            if shown.is_empty() {
                println!("no devices");
                let hidden = devices.len();
                if hidden > 0 {
                    println!("({hidden} unauthorized or offline; use --all)");
                }
            }
            for device in shown {
                let mut line = format!(
                    "{}\t{}\t{}",
                    device.serial,
                    device.state,
                    device.model.as_deref().unwrap_or("-")
                );
                if detailed && device.is_authorized() {
                    let arch = prov
                        .detect_architecture(device)
                        .await
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unsupported".into());
                    let rooted = prov.check_root(device).await;
                    line.push_str(&format!("\t{arch}\troot={rooted}"));
                }
                println!("{line}");
            }
        }

        Cmd::Info => {
            let device = choose_device(&prov, serial).await?;
            let info = prov.device_info(&device).await?;
            println!("serial\t{}", info.serial);
            println!("model\t{}", info.model.as_deref().unwrap_or("-"));
            println!("manufacturer\t{}", info.manufacturer.as_deref().unwrap_or("-"));
            println!("android\t{}", info.android_release.as_deref().unwrap_or("-"));
            println!("sdk\t{}", info.sdk_level.as_deref().unwrap_or("-"));
            println!("abi\t{}", info.raw_abi.as_deref().unwrap_or("-"));
            println!(
                "frida arch\t{}",
                info.arch.map(|a| a.target()).unwrap_or_else(|| "unsupported".into())
            );
            println!("root\t{}", info.rooted);
        }

        Cmd::Status { port: requested } => {
            let device = choose_device(&prov, serial).await?;
            let port = requested.unwrap_or(port);
            match prov.status(&device, port).await? {
                ServerStatus::NotRunning => println!("not running"),
                ServerStatus::Running {
                    pids,
                    port,
                    listening,
                } => {
                    let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                    println!(
                        "running\tpids={}\tport={port}\tlistening={listening}",
                        pids.join(",")
                    );
                }
            }
        }

        Cmd::Install {
            version,
            force,
            dir,
        } => {
            let device = choose_device(&prov, serial).await?;
            let binary = prov
                .ensure_installed(&device, version.as_deref(), dir.as_deref(), force)
                .await?;
            print_binary(&binary);
        }

        Cmd::Start {
            version,
            port: requested,
            no_install,
            replace,
        } => {
            let device = choose_device(&prov, serial).await?;
            let binary = if no_install {
                installed_binary(&prov, &device, version.as_deref()).await?
            } else {
                prov.ensure_installed(&device, version.as_deref(), None, false)
                    .await?
            };
            let port = requested.unwrap_or(port);
            let instance = match prov.start(&device, &binary, port).await {
                Err(ProvisionError::PortInUse { holders, .. })
                    if !holders.is_empty() && (replace || confirm_replace(&holders)?) =>
                {
                    for pid in holders {
                        prov.stop(&device, Some(pid)).await?;
                    }
                    prov.start(&device, &binary, port).await?
                }
                other => other?,
            };
            println!(
                "started {}\tpids={:?}\tport={}",
                instance.path, instance.pids, instance.port
            );
        }

        Cmd::Stop { pid } => {
            let device = choose_device(&prov, serial).await?;
            let report = prov.stop(&device, pid).await?;
            println!("stopped {}/{}", report.stopped, report.requested);
        }

        Cmd::Restart { port: requested } => {
            let device = choose_device(&prov, serial).await?;
            let instance = prov.restart(&device, requested.unwrap_or(port)).await?;
            println!(
                "restarted {}\tpids={:?}\tport={}",
                instance.path, instance.pids, instance.port
            );
        }

        Cmd::Uninstall { version } => {
            let device = choose_device(&prov, serial).await?;
            if let Some(version) = version {
                let removed = prov.uninstall(&device, &version, None).await?;
                println!("removed {}", removed.path);
            } else {
                let installed = prov.list_installed(&device, None).await?;
                if installed.is_empty() {
                    println!("nothing installed");
                }
                for binary in &installed {
                    prov.remove_installed(&device, binary).await?;
                    println!("removed {}", binary.path);
                }
            }
        }

        Cmd::Installed => {
            let device = choose_device(&prov, serial).await?;
            let installed = prov.list_installed(&device, None).await?;
            if installed.is_empty() {
                println!("nothing installed");
            }
            for binary in &installed {
                print_binary(binary);
            }
        }

        Cmd::Versions { limit } => {
            for version in prov.available_versions(limit).await? {
                println!("{version}");
            }
        }

        Cmd::Forward { local, remote } => {
            let device = choose_device(&prov, serial).await?;
            let remote = remote.unwrap_or(port);
            let local = local.unwrap_or(remote);
            prov.forward(&device, local, remote).await?;
            println!("tcp:{local} -> tcp:{remote}");
        }

        Cmd::Compat { fix } => {
            let device = choose_device(&prov, serial).await?;
            let report = prov.compatibility(&device).await?;
            println!("client\t{}", report.client.as_deref().unwrap_or("not installed"));
            println!("server\t{}", report.server.as_deref().unwrap_or("not installed"));
            println!("status\t{}", report.status);
            if let Some(command) = report.fix_command() {
                println!("fix\t{command}");
            }
            if fix && prov.fix_compatibility(&report).await? {
                println!("installed frida client {}", report.server.as_deref().unwrap_or_default());
            } else if compat_check_status(report.status) == CheckStatus::Error {
                return Ok(ExitCode::from(1));
            }
        }

        Cmd::Doctor => {
            let report = prov.doctor(serial).await;
            for check in &report.checks {
                println!("[{}]\t{}\t{}", check.status, check.name, check.message);
                if let (Some(fix), CheckStatus::Warning | CheckStatus::Error) =
                    (check.fix.as_deref(), check.status)
                {
                    println!("\t\tfix: {fix}");
                }
            }
            println!(
                "{} ok, {} warning(s), {} error(s), {} skipped",
                report.count(CheckStatus::Ok),
                report.count(CheckStatus::Warning),
                report.count(CheckStatus::Error),
                report.count(CheckStatus::Skipped)
            );
            if report.has_errors() {
                return Ok(ExitCode::from(1));
            }
        }

        Cmd::Wait { timeout } => {
            let device = prov
                .wait_for_device(serial, Duration::from_secs(timeout))
                .await?;
            println!("{device}");
        }

        Cmd::Config { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}

/// Like `select_device`, but asks which device to use when several are
/// attached and a terminal is available.
async fn choose_device(prov: &Provisioner, serial: Option<&str>) -> Result<DeviceHandle, ProvisionError> {
    match prov.select_device(serial).await {
        Err(ProvisionError::AmbiguousDevice { serials })
            if io::stdin().is_terminal() && io::stderr().is_terminal() =>
        {
            let choice = Select::new()
                .with_prompt("Several devices are connected; pick one")
                .items(&serials)
                .default(0)
                .interact_opt()
                .map_err(|e| ProvisionError::Io {
                    context: "device prompt".into(),
                    source: io::Error::other(e),
                })?;
            match choice {
                Some(idx) => prov.select_device(Some(&serials[idx])).await,
                None => Err(ProvisionError::AmbiguousDevice { serials }),
            }
        }
        other => other,
    }
}

/// Asks whether the frida-server processes in `holders` may be killed. Off a
/// terminal the answer is no.
fn confirm_replace(holders: &[u32]) -> Result<bool, ProvisionError> {
    if !(io::stdin().is_terminal() && io::stderr().is_terminal()) {
        return Ok(false);
    }
    let pids: Vec<String> = holders.iter().map(u32::to_string).collect();
    Confirm::new()
        .with_prompt(format!(
            "frida-server (pids {}) holds the port; stop it and start again?",
            pids.join(", ")
        ))
        .default(false)
        .interact()
        .map_err(|e| ProvisionError::Io {
            context: "replace prompt".into(),
            source: io::Error::other(e),
        })
}

async fn installed_binary(
    prov: &Provisioner,
    device: &DeviceHandle,
    version: Option<&str>,
) -> Result<InstalledBinary, ProvisionError> {
    let arch = prov.detect_architecture(device).await?;
    let installed: Vec<InstalledBinary> = prov
        .list_installed(device, None)
        .await?
        .into_iter()
        .filter(|b| b.arch == arch)
        .collect();
    debug!("{} binaries installed for {}", installed.len(), arch.target());
    let found = match version {
        Some(version) => {
            let version = version.trim_start_matches('v');
            installed.into_iter().find(|b| b.version == version)
        }
        None => installed.into_iter().next(),
    };
    found.ok_or_else(|| ProvisionError::NotInstalled {
        version: version.unwrap_or("any").to_string(),
        path: prov.config().server_dir.clone(),
    })
}

fn print_binary(binary: &InstalledBinary) {
    println!(
        "{}\t{}\t{}\t{}{}",
        binary.version,
        binary.arch.target(),
        binary.path,
        format_bytes(binary.size),
        if binary.executable { "" } else { "\t(not executable)" }
    );
}

fn config_command(
    cmd: &ConfigCmd,
    explicit: Option<&std::path::Path>,
    config: &ProvisionConfig,
) -> Result<ExitCode, ProvisionError> {
    let path = ProvisionConfig::resolve_path(explicit);
    match cmd {
        ConfigCmd::Show => {
            let rendered = serde_json::to_string_pretty(config).map_err(|e| ProvisionError::Io {
                context: "failed to render config".into(),
                source: io::Error::other(e),
            })?;
            println!("# {}", path.display());
            println!("{rendered}");
        }
        ConfigCmd::Init { force } => {
            if path.exists() && !force {
                eprintln!("{} already exists (use --force to overwrite)", path.display());
                return Ok(ExitCode::from(1));
            }
            ProvisionConfig::default()
                .save(&path)
                .map_err(|e| ProvisionError::Io {
                    context: format!("failed to write {}", path.display()),
                    source: e,
                })?;
            println!("wrote {}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
