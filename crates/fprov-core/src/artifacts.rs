use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::{io::AsyncWriteExt, process::Command, sync::watch};
use tracing::{debug, info};

use crate::cancel::{cancel_requested, cancelled, check_cancel};
use crate::catalog::ServerRelease;
use crate::error::{ProvisionError, Result};
use crate::hashing::sha256_file;
use crate::provision::server_file_name;
use crate::provisioner::Provisioner;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Staging name for an in-flight download: `<dest>.part`.
pub(crate) fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

pub(crate) fn local_artifact_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        Some(PathBuf::from(path))
    } else if url.starts_with('/') {
        Some(PathBuf::from(url))
    } else {
        None
    }
}

/// Streams `url` into `<dest>.part` and renames it to `dest` once the whole
/// body (and the advertised length, if any) has arrived. A cancelled
/// download leaves the `.part` file behind; the next attempt truncates it.
pub(crate) async fn download_file(
    client: &Client,
    url: &str,
    dest: &Path,
    expected_sha: Option<&str>,
    cancel_rx: Option<&watch::Receiver<bool>>,
    progress: Option<&ProgressFn>,
) -> Result<u64> {
    let download_err = |message: String| ProvisionError::DownloadError {
        url: url.to_string(),
        message,
    };

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| download_err(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(download_err(format!("server answered {}", resp.status())));
    }
    let total = resp.content_length();

    let tmp = part_path(dest);
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| ProvisionError::io(format!("failed to create {}", tmp.display()), e))?;

    let mut hasher = Sha256::new();
    let mut downloaded = 0u64;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel_requested(cancel_rx) {
            return Err(ProvisionError::Cancelled("download".into()));
        }
        let chunk = chunk.map_err(|e| {
            download_err(format!("connection failed after {downloaded} bytes: {e}"))
        })?;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| ProvisionError::io(format!("failed to write {}", tmp.display()), e))?;
        downloaded += chunk.len() as u64;
        if let Some(progress) = progress {
            progress(DownloadProgress { downloaded, total });
        }
    }

    file.flush()
        .await
        .map_err(|e| ProvisionError::io(format!("failed to flush {}", tmp.display()), e))?;
    drop(file);

    if let Some(total) = total {
        if downloaded != total {
            return Err(download_err(format!(
                "truncated body: received {downloaded} of {total} bytes"
            )));
        }
    }
    if downloaded == 0 {
        return Err(download_err("empty response body".into()));
    }
    if let Some(expected) = expected_sha {
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            let _ = fs::remove_file(&tmp);
            return Err(download_err(format!(
                "sha256 mismatch: expected {expected}, got {actual}"
            )));
        }
    }

    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| ProvisionError::io(format!("failed to finalize {}", dest.display()), e))?;
    Ok(downloaded)
}

fn cached_archive_usable(path: &Path, expected_sha: Option<&str>) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return false,
    }
    match expected_sha {
        None => true,
        Some(expected) => match sha256_file(path) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => true,
            _ => {
                let _ = fs::remove_file(path);
                false
            }
        },
    }
}

/// Turns a downloaded `.xz` archive into the raw server binary.
#[async_trait]
pub trait Decompressor: Send + Sync {
    fn tool(&self) -> String;

    fn available(&self) -> bool;

    /// Decompresses `archive` next to itself and returns the output path.
    async fn decompress(
        &self,
        archive: &Path,
        cancel_rx: Option<watch::Receiver<bool>>,
    ) -> Result<PathBuf>;
}

/// `xz --decompress --keep --force <archive>`.
pub struct XzDecompressor {
    program: PathBuf,
    timeout: Duration,
}

impl XzDecompressor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Decompressor for XzDecompressor {
    fn tool(&self) -> String {
        self.program.to_string_lossy().to_string()
    }

    fn available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    async fn decompress(
        &self,
        archive: &Path,
        cancel_rx: Option<watch::Receiver<bool>>,
    ) -> Result<PathBuf> {
        let extraction_err = |message: String| ProvisionError::ExtractionError {
            path: archive.display().to_string(),
            message,
        };
        let output_path = archive.with_extension("");

        info!("Decompressing {}", archive.display());
        let mut cmd = Command::new(&self.program);
        cmd.args(["--decompress", "--keep", "--force"])
            .arg(archive)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ProvisionError::DecompressorUnavailable { tool: self.tool() });
            }
            Err(err) => return Err(extraction_err(format!("failed to run {}: {err}", self.tool()))),
        };

        let output = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => return Err(extraction_err(format!("failed to wait for {}: {err}", self.tool()))),
                Err(_) => {
                    return Err(ProvisionError::Timeout {
                        command: format!("{} --decompress {}", self.tool(), archive.display()),
                        after: self.timeout,
                    })
                }
            },
            _ = cancelled(cancel_rx) => return Err(ProvisionError::Cancelled("decompression".into())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(extraction_err(format!(
                "{} exited with {}: {}",
                self.tool(),
                output.status,
                stderr.trim()
            )));
        }
        match fs::metadata(&output_path) {
            Ok(meta) if meta.len() > 0 => Ok(output_path),
            Ok(_) => Err(extraction_err("decompressed output is empty".into())),
            Err(err) => Err(extraction_err(format!(
                "expected output {} is missing: {err}",
                output_path.display()
            ))),
        }
    }
}

impl Provisioner {
    /// Makes the raw server binary for `release` available on the host and
    /// returns its path.
    pub(crate) async fn fetch_server_binary(&self, release: &ServerRelease) -> Result<PathBuf> {
        if !self.decompressor().available() {
            return Err(ProvisionError::DecompressorUnavailable {
                tool: self.decompressor().tool(),
            });
        }
        let dir = self.config().download_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProvisionError::io(format!("failed to create {}", dir.display()), e))?;
        let archive = dir.join(format!(
            "{}.xz",
            server_file_name(&release.version, release.arch)
        ));

        if let Some(source) = local_artifact_path(&release.url) {
            if !source.is_file() {
                return Err(ProvisionError::DownloadError {
                    url: release.url.clone(),
                    message: "local archive does not exist".into(),
                });
            }
            debug!("copying {} to {}", source.display(), archive.display());
            tokio::fs::copy(&source, &archive).await.map_err(|e| {
                ProvisionError::io(format!("failed to copy {}", source.display()), e)
            })?;
        } else if cached_archive_usable(&archive, release.sha256.as_deref()) {
            info!("Using cached archive {}", archive.display());
        } else {
            info!("Downloading {}", release.url);
            let bytes = download_file(
                self.http(),
                &release.url,
                &archive,
                release.sha256.as_deref(),
                self.cancel(),
                self.progress(),
            )
            .await?;
            info!(
                "Saved {} ({})",
                archive.display(),
                fprov_util::format_bytes(bytes)
            );
        }

        check_cancel(self.cancel(), "install")?;
        let result = self
            .decompressor()
            .decompress(&archive, self.cancel().cloned())
            .await;
        if let Err(ProvisionError::ExtractionError { .. }) = &result {
            // an undecodable archive would otherwise be reused from the cache
            if let Err(err) = fs::remove_file(&archive) {
                debug!("failed to remove {}: {err}", archive.display());
            }
        }
        result
    }

    pub(crate) fn discard_download(&self, binary: &Path) {
        if self.config().keep_downloads {
            return;
        }
        let mut archive = binary.as_os_str().to_os_string();
        archive.push(".xz");
        for path in [binary.to_path_buf(), PathBuf::from(archive)] {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    debug!("failed to remove {}: {err}", path.display());
                }
            }
        }
    }
}
