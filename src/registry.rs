// src/registry.rs

//! Resolving package requests to concrete artifacts
//!
//! A [`Registry`] turns `(name, version spec)` into an [`ArtifactDescriptor`].
//! Two catalog formats are supported:
//! - [`ReleaseRegistry`]: a catalog mapping names to GitHub repositories,
//!   resolved through the releases API (the format cmam's own catalog uses)
//! - [`IndexRegistry`]: a single JSON index listing every version with its
//!   URL and digest, suitable for mirrors and `file://` setups
//!
//! [`StaticRegistry`] holds descriptors in memory.

use crate::config::{RegistryKind, RegistrySettings};
use crate::download::{Fetcher, RetryPolicy, fetch_bytes};
use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::package::{ArtifactDescriptor, PackageRef, VersionSpec, normalize_name, strip_v};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Source of artifact metadata
pub trait Registry: Send + Sync {
    /// Missing package -> `PackageNotFound`; missing version -> `VersionNotFound`
    fn resolve(&self, package: &PackageRef) -> Result<ArtifactDescriptor>;
}

/// Default file name of an installed package on this platform
pub fn default_entry_point(name: &str) -> String {
    format!("{}{}", name, std::env::consts::EXE_SUFFIX)
}

/// Build the registry described by the settings
pub fn from_settings(
    settings: &RegistrySettings,
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
) -> Box<dyn Registry> {
    match settings.kind {
        RegistryKind::Releases => Box::new(ReleaseRegistry::new(
            &settings.url,
            &settings.api_url,
            &settings.self_link,
            fetcher,
            policy,
        )),
        RegistryKind::Index => Box::new(IndexRegistry::new(&settings.url, fetcher, policy)),
    }
}

/// Order two version strings: semver when both parse, numeric-aware otherwise
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (strip_v(a), strip_v(b));
    if let (Ok(va), Ok(vb)) = (semver::Version::parse(a), semver::Version::parse(b)) {
        return va.cmp(&vb);
    }

    let mut left = a.split(['.', '-', '+']);
    let mut right = b.split(['.', '-', '+']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn pick_version<'a, T>(
    name: &str,
    versions: &'a BTreeMap<String, T>,
    spec: &VersionSpec,
) -> Result<(&'a String, &'a T)> {
    match spec {
        VersionSpec::Latest => versions
            .iter()
            .max_by(|(a, _), (b, _)| compare_versions(a, b))
            .ok_or_else(|| Error::VersionNotFound {
                name: name.to_string(),
                version: "latest".to_string(),
            }),
        VersionSpec::Exact(wanted) => versions
            .iter()
            .find(|(v, _)| strip_v(v) == wanted.as_str())
            .ok_or_else(|| Error::VersionNotFound {
                name: name.to_string(),
                version: wanted.clone(),
            }),
    }
}

/// In-memory registry
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    packages: HashMap<String, BTreeMap<String, ArtifactDescriptor>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one version; the descriptor's name is normalized
    pub fn add(&mut self, mut descriptor: ArtifactDescriptor) -> Result<()> {
        descriptor.name = normalize_name(&descriptor.name)?;
        self.packages
            .entry(descriptor.name.clone())
            .or_default()
            .insert(descriptor.version.clone(), descriptor);
        Ok(())
    }

    pub fn with(mut self, descriptor: ArtifactDescriptor) -> Result<Self> {
        self.add(descriptor)?;
        Ok(self)
    }
}

impl Registry for StaticRegistry {
    fn resolve(&self, package: &PackageRef) -> Result<ArtifactDescriptor> {
        let versions = self
            .packages
            .get(package.name())
            .ok_or_else(|| Error::PackageNotFound(package.name().to_string()))?;
        let (_, descriptor) = pick_version(package.name(), versions, package.version())?;
        Ok(descriptor.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexDocument {
    packages: HashMap<String, IndexPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexPackage {
    versions: BTreeMap<String, IndexVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexVersion {
    url: String,
    digest: String,
    entry_point: Option<String>,
}

/// Registry backed by one JSON index document
pub struct IndexRegistry {
    url: String,
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    index: OnceLock<IndexDocument>,
}

impl IndexRegistry {
    pub fn new(url: &str, fetcher: Arc<dyn Fetcher>, policy: RetryPolicy) -> Self {
        Self {
            url: url.to_string(),
            fetcher,
            policy,
            index: OnceLock::new(),
        }
    }

    fn index(&self) -> Result<&IndexDocument> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }

        info!("Fetching package index from {}", self.url);
        let bytes = fetch_bytes(self.fetcher.as_ref(), &self.policy, &self.url)?
            .ok_or_else(|| Error::Network(format!("package index not found at {}", self.url)))?;

        let mut document: IndexDocument = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ParseError(format!("Failed to parse index {}: {}", self.url, e)))?;
        document.packages = document
            .packages
            .into_iter()
            .map(|(name, pkg)| (name.to_ascii_lowercase(), pkg))
            .collect();
        debug!("Index lists {} packages", document.packages.len());

        let _ = self.index.set(document);
        self.index
            .get()
            .ok_or_else(|| Error::Network("package index unavailable".to_string()))
    }
}

impl Registry for IndexRegistry {
    fn resolve(&self, package: &PackageRef) -> Result<ArtifactDescriptor> {
        let index = self.index()?;
        let entry = index
            .packages
            .get(package.name())
            .ok_or_else(|| Error::PackageNotFound(package.name().to_string()))?;
        let (version, found) = pick_version(package.name(), &entry.versions, package.version())?;

        let descriptor = ArtifactDescriptor {
            name: package.name().to_string(),
            version: strip_v(version).to_string(),
            download_url: found.url.clone(),
            expected_digest: Digest::parse(&found.digest)?,
            entry_point: found
                .entry_point
                .clone()
                .unwrap_or_else(|| default_entry_point(package.name())),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    link: String,
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
    digest: Option<String>,
}

/// Name of cmam's own package in the catalog
const SELF_NAME: &str = "cmam";

/// Catalog of `owner/repo` links resolved through GitHub releases
pub struct ReleaseRegistry {
    catalog_url: String,
    api_url: String,
    self_link: String,
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    catalog: OnceLock<HashMap<String, CatalogEntry>>,
}

impl ReleaseRegistry {
    pub fn new(
        catalog_url: &str,
        api_url: &str,
        self_link: &str,
        fetcher: Arc<dyn Fetcher>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            catalog_url: catalog_url.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            self_link: self_link.to_string(),
            fetcher,
            policy,
            catalog: OnceLock::new(),
        }
    }

    fn catalog(&self) -> Result<&HashMap<String, CatalogEntry>> {
        if let Some(catalog) = self.catalog.get() {
            return Ok(catalog);
        }

        info!("Fetching package catalog from {}", self.catalog_url);
        let bytes = fetch_bytes(self.fetcher.as_ref(), &self.policy, &self.catalog_url)?
            .ok_or_else(|| {
                Error::Network(format!("package catalog not found at {}", self.catalog_url))
            })?;
        let catalog: HashMap<String, CatalogEntry> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ParseError(format!("Failed to parse catalog: {}", e)))?;
        let catalog = catalog
            .into_iter()
            .map(|(name, entry)| (name.to_ascii_lowercase(), entry))
            .collect();

        let _ = self.catalog.set(catalog);
        self.catalog
            .get()
            .ok_or_else(|| Error::Network("package catalog unavailable".to_string()))
    }

    fn link_for(&self, name: &str) -> Result<String> {
        match self.catalog()?.get(name) {
            Some(entry) => Ok(entry.link.clone()),
            None if name == SELF_NAME => Ok(self.self_link.clone()),
            None => Err(Error::PackageNotFound(name.to_string())),
        }
    }

    fn release_url(&self, link: &str, spec: &VersionSpec) -> String {
        match spec {
            VersionSpec::Latest => format!("{}/repos/{}/releases/latest", self.api_url, link),
            VersionSpec::Exact(v) => {
                format!("{}/repos/{}/releases/tags/v{}", self.api_url, link, v)
            }
        }
    }
}

/// Pick the asset that is this platform's executable for `name`
fn select_asset<'a>(name: &str, assets: &'a [ReleaseAsset]) -> Option<&'a ReleaseAsset> {
    let exact = default_entry_point(name);
    let platform = format!("{}-{}", name, std::env::consts::OS);
    let suffix = std::env::consts::EXE_SUFFIX;

    assets
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case(&exact))
        .or_else(|| {
            assets
                .iter()
                .find(|a| a.name.to_ascii_lowercase().starts_with(&platform))
        })
        .or_else(|| {
            if suffix.is_empty() {
                None
            } else {
                assets
                    .iter()
                    .find(|a| a.name.to_ascii_lowercase().ends_with(suffix))
            }
        })
}

impl Registry for ReleaseRegistry {
    fn resolve(&self, package: &PackageRef) -> Result<ArtifactDescriptor> {
        let link = self.link_for(package.name())?;
        let url = self.release_url(&link, package.version());
        debug!("Resolving {} via {}", package, url);

        let bytes = fetch_bytes(self.fetcher.as_ref(), &self.policy, &url)?.ok_or_else(|| {
            Error::VersionNotFound {
                name: package.name().to_string(),
                version: package.version().to_string(),
            }
        })?;
        let release: Release = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ParseError(format!("Failed to parse release {}: {}", url, e)))?;

        let asset = select_asset(package.name(), &release.assets).ok_or_else(|| {
            Error::InvalidArtifact(format!(
                "release {} of {} has no executable for {}",
                release.tag_name,
                package.name(),
                std::env::consts::OS
            ))
        })?;

        // Unverifiable artifacts are never installed
        let digest = asset.digest.as_deref().ok_or_else(|| {
            Error::InvalidDigestFormat(format!(
                "asset {} of {} {} publishes no digest",
                asset.name,
                package.name(),
                release.tag_name
            ))
        })?;

        let descriptor = ArtifactDescriptor {
            name: package.name().to_string(),
            version: strip_v(&release.tag_name).to_string(),
            download_url: asset.browser_download_url.clone(),
            expected_digest: Digest::parse(digest)?,
            entry_point: default_entry_point(package.name()),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::FileFetcher;
    use crate::hash;
    use std::fs;
    use std::path::Path;

    fn descriptor(version: &str) -> ArtifactDescriptor {
        ArtifactDescriptor {
            name: "tool".to_string(),
            version: version.to_string(),
            download_url: format!("file:///srv/tool-{}", version),
            expected_digest: hash::digest(version.as_bytes()),
            entry_point: "tool".to_string(),
        }
    }

    fn file_url(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    #[test]
    fn test_version_ordering() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("v2.0.0", "1.99.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0-rc.1", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.2", "1.2"), Ordering::Equal);
    }

    #[test]
    fn test_static_registry_resolution() {
        let registry = StaticRegistry::new()
            .with(descriptor("1.2.0"))
            .unwrap()
            .with(descriptor("1.10.0"))
            .unwrap();

        let latest = registry.resolve(&PackageRef::latest("TOOL").unwrap()).unwrap();
        assert_eq!(latest.version, "1.10.0");

        let exact = PackageRef::new("tool", VersionSpec::from_option(Some("v1.2.0"))).unwrap();
        assert_eq!(registry.resolve(&exact).unwrap().version, "1.2.0");

        let missing = PackageRef::new("tool", VersionSpec::Exact("9.9".to_string())).unwrap();
        assert!(matches!(
            registry.resolve(&missing),
            Err(Error::VersionNotFound { .. })
        ));
        assert!(matches!(
            registry.resolve(&PackageRef::latest("other").unwrap()),
            Err(Error::PackageNotFound(_))
        ));
    }

    #[test]
    fn test_index_registry() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.json");
        let digest = hash::digest(b"bin");
        fs::write(
            &index,
            format!(
                r#"{{"packages": {{"Tool": {{"versions": {{
                    "1.0.0": {{"url": "file:///srv/tool-1", "digest": "{d}"}},
                    "2.0.0": {{"url": "file:///srv/tool-2", "digest": "{d}", "entryPoint": "tool-bin"}}
                }}}}}}}}"#,
                d = digest
            ),
        )
        .unwrap();

        let registry = IndexRegistry::new(
            &file_url(&index),
            Arc::new(FileFetcher),
            RetryPolicy::default(),
        );
        let latest = registry.resolve(&PackageRef::latest("tool").unwrap()).unwrap();
        assert_eq!(latest.version, "2.0.0");
        assert_eq!(latest.entry_point, "tool-bin");
        assert_eq!(latest.expected_digest, digest);

        let old = PackageRef::new("tool", VersionSpec::Exact("1.0.0".to_string())).unwrap();
        assert_eq!(
            registry.resolve(&old).unwrap().entry_point,
            default_entry_point("tool")
        );
    }

    #[test]
    fn test_index_registry_rejects_escaping_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.json");
        fs::write(
            &index,
            format!(
                r#"{{"packages": {{"tool": {{"versions": {{"1.0.0": {{"url": "file:///x", "digest": "{}", "entryPoint": "../evil"}}}}}}}}}}"#,
                hash::digest(b"x")
            ),
        )
        .unwrap();

        let registry =
            IndexRegistry::new(&file_url(&index), Arc::new(FileFetcher), RetryPolicy::default());
        assert!(matches!(
            registry.resolve(&PackageRef::latest("tool").unwrap()),
            Err(Error::InvalidArtifact(_))
        ));
    }

    #[test]
    fn test_release_registry() {
        let dir = tempfile::tempdir().unwrap();
        let api = dir.path().join("api");
        let release_dir = api.join("repos/acme/tool/releases");
        fs::create_dir_all(release_dir.join("tags")).unwrap();

        let catalog = dir.path().join("packages.json");
        fs::write(&catalog, r#"{"tool": {"link": "acme/tool"}}"#).unwrap();

        let digest = hash::digest(b"tool");
        let asset_name = default_entry_point("tool");
        let release = format!(
            r#"{{"tag_name": "v1.4.0", "assets": [
                {{"name": "README.md", "browser_download_url": "file:///readme", "digest": null}},
                {{"name": "{}", "browser_download_url": "file:///tool", "digest": "{}"}}
            ]}}"#,
            asset_name, digest
        );
        fs::write(release_dir.join("latest"), &release).unwrap();
        fs::write(release_dir.join("tags/v1.4.0"), &release).unwrap();

        let registry = ReleaseRegistry::new(
            &file_url(&catalog),
            &file_url(&api),
            "acme/cmam",
            Arc::new(FileFetcher),
            RetryPolicy::default(),
        );

        let latest = registry.resolve(&PackageRef::latest("tool").unwrap()).unwrap();
        assert_eq!(latest.version, "1.4.0");
        assert_eq!(latest.download_url, "file:///tool");
        assert_eq!(latest.expected_digest, digest);

        let pinned = PackageRef::new("tool", VersionSpec::Exact("1.4.0".to_string())).unwrap();
        assert_eq!(registry.resolve(&pinned).unwrap().version, "1.4.0");

        let missing = PackageRef::new("tool", VersionSpec::Exact("0.1.0".to_string())).unwrap();
        assert!(matches!(
            registry.resolve(&missing),
            Err(Error::VersionNotFound { .. })
        ));
        assert!(matches!(
            registry.resolve(&PackageRef::latest("nope").unwrap()),
            Err(Error::PackageNotFound(_))
        ));
    }

    #[test]
    fn test_release_asset_without_digest_is_refused() {
        let assets = vec![ReleaseAsset {
            name: default_entry_point("tool"),
            browser_download_url: "file:///tool".to_string(),
            digest: None,
        }];
        assert!(select_asset("tool", &assets).is_some());

        let dir = tempfile::tempdir().unwrap();
        let release_dir = dir.path().join("api/repos/acme/tool/releases");
        fs::create_dir_all(&release_dir).unwrap();
        fs::write(
            release_dir.join("latest"),
            format!(
                r#"{{"tag_name": "v1.0.0", "assets": [{{"name": "{}", "browser_download_url": "file:///tool"}}]}}"#,
                default_entry_point("tool")
            ),
        )
        .unwrap();
        let catalog = dir.path().join("packages.json");
        fs::write(&catalog, r#"{"tool": {"link": "acme/tool"}}"#).unwrap();

        let registry = ReleaseRegistry::new(
            &file_url(&catalog),
            &file_url(&dir.path().join("api")),
            "acme/cmam",
            Arc::new(FileFetcher),
            RetryPolicy::default(),
        );
        assert!(matches!(
            registry.resolve(&PackageRef::latest("tool").unwrap()),
            Err(Error::InvalidDigestFormat(_))
        ));
    }
}
