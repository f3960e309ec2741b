use std::{sync::Arc, time::Duration};

use reqwest::Client;
use tokio::sync::watch;
use tracing::debug;

use crate::artifacts::{Decompressor, ProgressFn, XzDecompressor};
use crate::bridge::{AdbBridge, BridgeClient};
use crate::catalog::{http_client, FileCatalog, GithubCatalog, ReleaseCatalog};
use crate::compat::{ClientTooling, FridaTools};
use crate::config::ProvisionConfig;
use crate::error::Result;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Entry point for every device operation. Holds the resolved config and
/// the external capabilities (bridge, catalog, decompressor, client
/// tooling); operations live in `impl Provisioner` blocks next to the
/// types they produce.
pub struct Provisioner {
    config: ProvisionConfig,
    bridge: Arc<dyn BridgeClient>,
    catalog: Arc<dyn ReleaseCatalog>,
    decompressor: Arc<dyn Decompressor>,
    client_tooling: Arc<dyn ClientTooling>,
    http: Client,
    cancel: Option<watch::Receiver<bool>>,
    progress: Option<ProgressFn>,
}

impl Provisioner {
    /// Production wiring: adb, xz, `frida`/`pip`, and either the GitHub
    /// release API or the configured catalog file.
    pub fn new(config: ProvisionConfig) -> Result<Self> {
        let timeout = config.command_timeout();
        let bridge = Arc::new(AdbBridge::new(config.adb_path(), timeout));
        let catalog: Arc<dyn ReleaseCatalog> = match config.catalog_path.as_deref() {
            Some(path) => {
                debug!("using release catalog {}", path.display());
                Arc::new(FileCatalog::load(path)?)
            }
            None => Arc::new(GithubCatalog::new(timeout)?),
        };
        let decompressor = Arc::new(XzDecompressor::new(config.xz_path(), timeout));
        let client_tooling = Arc::new(FridaTools::new(timeout));
        Self::with_parts(config, bridge, catalog, decompressor, client_tooling)
    }

    pub fn with_parts(
        config: ProvisionConfig,
        bridge: Arc<dyn BridgeClient>,
        catalog: Arc<dyn ReleaseCatalog>,
        decompressor: Arc<dyn Decompressor>,
        client_tooling: Arc<dyn ClientTooling>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            bridge,
            catalog,
            decompressor,
            client_tooling,
            http: http_client(DOWNLOAD_TIMEOUT)?,
            cancel: None,
            progress: None,
        })
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub fn bridge(&self) -> &dyn BridgeClient {
        self.bridge.as_ref()
    }

    pub fn catalog(&self) -> &dyn ReleaseCatalog {
        self.catalog.as_ref()
    }

    pub fn decompressor(&self) -> &dyn Decompressor {
        self.decompressor.as_ref()
    }

    pub fn client_tooling(&self) -> &dyn ClientTooling {
        self.client_tooling.as_ref()
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn cancel(&self) -> Option<&watch::Receiver<bool>> {
        self.cancel.as_ref()
    }

    pub(crate) fn progress(&self) -> Option<&ProgressFn> {
        self.progress.as_ref()
    }

    /// Newest stable versions from the catalog.
    pub async fn available_versions(&self, limit: usize) -> Result<Vec<String>> {
        self.catalog.versions(limit).await
    }
}

#[cfg(test)]
impl Provisioner {
    /// Fake bridge, empty catalog, copying decompressor, no client tooling,
    /// and a 1 ms start poll.
    pub(crate) fn for_tests(bridge: crate::testing::FakeBridge) -> Self {
        use crate::testing::{CopyDecompressor, FakeClientTooling};

        let config = ProvisionConfig {
            start_poll_millis: 1,
            ..ProvisionConfig::default()
        };
        let catalog = FileCatalog::from_json("{}").unwrap();
        Self::with_parts(
            config,
            Arc::new(bridge),
            Arc::new(catalog),
            Arc::new(CopyDecompressor::default()),
            Arc::new(FakeClientTooling::default()),
        )
        .unwrap()
    }

    pub(crate) fn config_mut(&mut self) -> &mut ProvisionConfig {
        &mut self.config
    }

    pub(crate) fn set_catalog(&mut self, catalog: Arc<dyn ReleaseCatalog>) {
        self.catalog = catalog;
    }

    pub(crate) fn set_decompressor(&mut self, decompressor: Arc<dyn Decompressor>) {
        self.decompressor = decompressor;
    }

    pub(crate) fn set_client_tooling(&mut self, client_tooling: Arc<dyn ClientTooling>) {
        self.client_tooling = client_tooling;
    }
}
