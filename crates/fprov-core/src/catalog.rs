use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::capability::Arch;
use crate::error::{ProvisionError, Result};

const GITHUB_API: &str = "https://api.github.com/repos/frida/frida";
const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One downloadable frida-server build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerRelease {
    pub version: String,
    pub arch: Arch,
    pub url: String,
    /// Digest of the compressed asset, when the catalog publishes one.
    pub sha256: Option<String>,
}

impl ServerRelease {
    pub fn target(&self) -> String {
        self.arch.target()
    }
}

#[async_trait]
pub trait ReleaseCatalog: Send + Sync {
    /// Newest stable version.
    async fn latest_version(&self) -> Result<String>;

    /// Exact `version` for `android-<arch>`, or `ReleaseNotFound`.
    async fn release(&self, version: &str, arch: Arch) -> Result<ServerRelease>;

    /// Stable versions, newest first.
    async fn versions(&self, limit: usize) -> Result<Vec<String>>;
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(concat!("fprov/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
        .map_err(|e| ProvisionError::CatalogError(format!("failed to build http client: {e}")))
}

/// Lenient semver: strips a leading `v` and pads `12.11` to `12.11.0`.
pub(crate) fn version_key(version: &str) -> Option<semver::Version> {
    let version = version.trim().trim_start_matches('v');
    if let Ok(parsed) = semver::Version::parse(version) {
        return Some(parsed);
    }
    let (core, rest) = match version.find(|c: char| c == '-' || c == '+') {
        Some(idx) => version.split_at(idx),
        None => (version, ""),
    };
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => return None,
    };
    semver::Version::parse(&padded).ok()
}

/// Sorts newest first; unparsable versions sink to the end.
pub(crate) fn sort_versions_desc(versions: &mut [String]) {
    versions.sort_by(|a, b| version_key(b).cmp(&version_key(a)));
}

fn is_stable(version: &str) -> bool {
    version_key(version).is_some_and(|v| v.pre.is_empty())
}

fn asset_name(version: &str, arch: Arch) -> String {
    format!("frida-server-{version}-{}.xz", arch.target())
}

/// Release listing from the GitHub API for frida/frida.
pub struct GithubCatalog {
    client: Client,
    api_base: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    digest: Option<String>,
}

impl GithubCatalog {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_base: GITHUB_API.to_string(),
            token: fprov_util::env_string(GITHUB_TOKEN_ENV),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>> {
        let url = format!("{}{path}", self.api_base);
        debug!("GET {url}");
        let mut req = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = self.token.as_ref() {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ProvisionError::CatalogError(format!("GET {url}: {e}")))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(ProvisionError::CatalogError(format!(
                "GET {url}: status {}",
                resp.status()
            )));
        }
        let body = resp
            .json::<T>()
            .await
            .map_err(|e| ProvisionError::CatalogError(format!("GET {url}: bad response: {e}")))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl ReleaseCatalog for GithubCatalog {
    async fn latest_version(&self) -> Result<String> {
        let release: GithubRelease = self
            .get_json("/releases/latest")
            .await?
            .ok_or_else(|| ProvisionError::CatalogError("no published releases".into()))?;
        let version = release.tag_name.trim_start_matches('v').to_string();
        info!("Latest frida release is {version}");
        Ok(version)
    }

    async fn release(&self, version: &str, arch: Arch) -> Result<ServerRelease> {
        let not_found = || ProvisionError::ReleaseNotFound {
            version: version.to_string(),
            target: arch.target(),
        };
        let release: GithubRelease = self
            .get_json(&format!("/releases/tags/{version}"))
            .await?
            .ok_or_else(not_found)?;
        let wanted = asset_name(version, arch);
        let asset = release
            .assets
            .into_iter()
            .find(|asset| asset.name == wanted)
            .ok_or_else(not_found)?;
        Ok(ServerRelease {
            version: version.to_string(),
            arch,
            url: asset.browser_download_url,
            sha256: asset
                .digest
                .as_deref()
                .and_then(|d| d.strip_prefix("sha256:"))
                .map(str::to_ascii_lowercase),
        })
    }

    async fn versions(&self, limit: usize) -> Result<Vec<String>> {
        let per_page = limit.clamp(1, 100);
        let releases: Vec<GithubRelease> = self
            .get_json(&format!("/releases?per_page={per_page}"))
            .await?
            .unwrap_or_default();
        let mut versions: Vec<String> = releases
            .into_iter()
            .filter(|r| !r.prerelease && !r.draft)
            .map(|r| r.tag_name.trim_start_matches('v').to_string())
            .collect();
        sort_versions_desc(&mut versions);
        versions.truncate(limit);
        Ok(versions)
    }
}

/// A catalog document on disk:
///
/// ```json
/// { "versions": { "16.1.17": { "android-arm64": "https://.../frida-server-16.1.17-android-arm64.xz" } } }
/// ```
///
/// An entry may also be `{ "url": "...", "sha256": "..." }`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CatalogDocument {
    pub versions: BTreeMap<String, BTreeMap<String, CatalogEntry>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum CatalogEntry {
    Url(String),
    Artifact {
        url: String,
        #[serde(default)]
        sha256: Option<String>,
    },
}

impl CatalogEntry {
    fn url(&self) -> &str {
        match self {
            CatalogEntry::Url(url) => url,
            CatalogEntry::Artifact { url, .. } => url,
        }
    }

    fn sha256(&self) -> Option<&str> {
        match self {
            CatalogEntry::Url(_) => None,
            CatalogEntry::Artifact { sha256, .. } => sha256.as_deref(),
        }
    }
}

pub struct FileCatalog {
    source: PathBuf,
    document: CatalogDocument,
}

impl FileCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ProvisionError::CatalogError(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut catalog = Self::from_json(&raw).map_err(|e| match e {
            ProvisionError::CatalogError(msg) => {
                ProvisionError::CatalogError(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
        catalog.source = path.to_path_buf();
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let document = serde_json::from_str::<CatalogDocument>(raw)
            .map_err(|e| ProvisionError::CatalogError(format!("invalid catalog: {e}")))?;
        Ok(Self {
            source: PathBuf::from("<inline>"),
            document,
        })
    }

    fn sorted_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.document.versions.keys().cloned().collect();
        sort_versions_desc(&mut versions);
        versions
    }
}

#[async_trait]
impl ReleaseCatalog for FileCatalog {
    async fn latest_version(&self) -> Result<String> {
        let versions = self.sorted_versions();
        versions
            .iter()
            .find(|v| is_stable(v))
            .or_else(|| versions.first())
            .cloned()
            .ok_or_else(|| {
                ProvisionError::CatalogError(format!(
                    "catalog {} lists no versions",
                    self.source.display()
                ))
            })
    }

    async fn release(&self, version: &str, arch: Arch) -> Result<ServerRelease> {
        let target = arch.target();
        let entry = self
            .document
            .versions
            .get(version)
            .and_then(|targets| targets.get(&target))
            .filter(|entry| !entry.url().trim().is_empty())
            .ok_or_else(|| ProvisionError::ReleaseNotFound {
                version: version.to_string(),
                target,
            })?;
        Ok(ServerRelease {
            version: version.to_string(),
            arch,
            url: entry.url().to_string(),
            sha256: entry.sha256().map(str::to_ascii_lowercase),
        })
    }

    async fn versions(&self, limit: usize) -> Result<Vec<String>> {
        let mut versions: Vec<String> = self
            .sorted_versions()
            .into_iter()
            .filter(|v| is_stable(v))
            .collect();
        versions.truncate(limit);
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve_routes;

    const TWO_VERSIONS: &str = r#"{
        "versions": {
            "16.0.1": {
                "android-arm64": "https://example.invalid/16.0.1/frida-server-16.0.1-android-arm64.xz"
            },
            "16.1.17": {
                "android-arm64": "https://example.invalid/16.1.17/frida-server-16.1.17-android-arm64.xz",
                "android-x86": { "url": "https://example.invalid/16.1.17/x86.xz", "sha256": "ABCDEF" }
            }
        }
    }"#;

    #[test]
    fn version_key_is_lenient() {
        assert_eq!(version_key("v16.1.17"), Some(semver::Version::new(16, 1, 17)));
        assert_eq!(version_key("12.11"), Some(semver::Version::new(12, 11, 0)));
        assert!(version_key("17.0.0-rc1").unwrap().pre.as_str() == "rc1");
        assert_eq!(version_key("snapshot"), None);
    }

    #[test]
    fn sorting_is_semantic_not_lexical() {
        let mut versions = vec![
            "9.1.0".to_string(),
            "16.0.1".to_string(),
            "junk".to_string(),
            "16.1.17".to_string(),
            "16.1.2".to_string(),
        ];
        sort_versions_desc(&mut versions);
        assert_eq!(versions, vec!["16.1.17", "16.1.2", "16.0.1", "9.1.0", "junk"]);
    }

    #[tokio::test]
    async fn latest_resolves_highest_version() {
        let catalog = FileCatalog::from_json(TWO_VERSIONS).unwrap();
        assert_eq!(catalog.latest_version().await.unwrap(), "16.1.17");
    }

    #[tokio::test]
    async fn latest_skips_prereleases_when_a_stable_exists() {
        let catalog = FileCatalog::from_json(
            r#"{ "versions": { "16.1.17": {}, "17.0.0-rc1": {} } }"#,
        )
        .unwrap();
        assert_eq!(catalog.latest_version().await.unwrap(), "16.1.17");
        assert_eq!(catalog.versions(10).await.unwrap(), vec!["16.1.17"]);
    }

    #[tokio::test]
    async fn exact_version_resolves_url_and_digest() {
        let catalog = FileCatalog::from_json(TWO_VERSIONS).unwrap();
        let release = catalog.release("16.1.17", Arch::X86).await.unwrap();
        assert_eq!(release.url, "https://example.invalid/16.1.17/x86.xz");
        assert_eq!(release.sha256.as_deref(), Some("abcdef"));
        assert_eq!(release.target(), "android-x86");
    }

    #[tokio::test]
    async fn unknown_version_or_target_is_release_not_found() {
        let catalog = FileCatalog::from_json(TWO_VERSIONS).unwrap();
        match catalog.release("99.0.0", Arch::Arm64).await {
            Err(ProvisionError::ReleaseNotFound { version, target }) => {
                assert_eq!(version, "99.0.0");
                assert_eq!(target, "android-arm64");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            catalog.release("16.0.1", Arch::X86_64).await,
            Err(ProvisionError::ReleaseNotFound { .. })
        ));
    }

    #[test]
    fn malformed_document_is_catalog_error() {
        assert!(matches!(
            FileCatalog::from_json("{ not json"),
            Err(ProvisionError::CatalogError(_))
        ));
    }

    #[test]
    fn load_reports_path_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let Err(ProvisionError::CatalogError(msg)) = FileCatalog::load(&path) else {
            panic!("expected catalog error");
        };
        assert!(msg.contains("catalog.json"));
    }

    #[test]
    fn github_asset_naming() {
        assert_eq!(
            asset_name("16.1.17", Arch::Arm64),
            "frida-server-16.1.17-android-arm64.xz"
        );
    }

    fn github_release(tag: &str, prerelease: bool) -> serde_json::Value {
        serde_json::json!({
            "tag_name": tag,
            "prerelease": prerelease,
            "draft": false,
            "assets": [
                {
                    "name": format!("frida-server-{tag}-android-arm64.xz"),
                    "browser_download_url": format!("https://example.invalid/{tag}/arm64.xz"),
                    "digest": "sha256:ABCDEF0123"
                },
                {
                    "name": format!("frida-server-{tag}-android-x86.xz"),
                    "browser_download_url": format!("https://example.invalid/{tag}/x86.xz")
                },
                {
                    "name": format!("frida-gadget-{tag}-android-arm.so.xz"),
                    "browser_download_url": format!("https://example.invalid/{tag}/gadget.xz")
                }
            ]
        })
    }

    async fn github_catalog() -> GithubCatalog {
        let mut draft = github_release("16.2.0", false);
        draft["draft"] = serde_json::Value::Bool(true);
        let listing = serde_json::json!([
            github_release("17.0.0-rc1", true),
            draft,
            github_release("16.0.1", false),
            github_release("16.1.17", false),
        ]);
        let base = serve_routes(vec![
            ("/releases/latest", github_release("16.1.17", false).to_string()),
            ("/releases/tags/16.1.17", github_release("16.1.17", false).to_string()),
            ("/releases?per_page=10", listing.to_string()),
        ])
        .await;
        GithubCatalog::new(Duration::from_secs(5))
            .unwrap()
            .with_api_base(format!("{base}/"))
    }

    #[tokio::test]
    async fn github_latest_comes_from_the_latest_endpoint() {
        let catalog = github_catalog().await;
        assert_eq!(catalog.latest_version().await.unwrap(), "16.1.17");
    }

    #[tokio::test]
    async fn github_release_picks_the_server_asset_and_digest() {
        let catalog = github_catalog().await;
        let release = catalog.release("16.1.17", Arch::Arm64).await.unwrap();
        assert_eq!(release.url, "https://example.invalid/16.1.17/arm64.xz");
        assert_eq!(release.sha256.as_deref(), Some("abcdef0123"));

        let release = catalog.release("16.1.17", Arch::X86).await.unwrap();
        assert_eq!(release.url, "https://example.invalid/16.1.17/x86.xz");
        assert_eq!(release.sha256, None);
    }

    #[tokio::test]
    async fn github_missing_tag_or_asset_is_release_not_found() {
        let catalog = github_catalog().await;
        let err = catalog.release("99.0.0", Arch::Arm64).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ReleaseNotFound { .. }), "{err:?}");

        let err = catalog.release("16.1.17", Arch::Arm).await.unwrap_err();
        match err {
            ProvisionError::ReleaseNotFound { version, target } => {
                assert_eq!(version, "16.1.17");
                assert_eq!(target, "android-arm");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn github_versions_skip_prereleases_and_drafts() {
        let catalog = github_catalog().await;
        assert_eq!(catalog.versions(10).await.unwrap(), vec!["16.1.17", "16.0.1"]);
    }
}
