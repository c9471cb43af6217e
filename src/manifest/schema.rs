// src/manifest/schema.rs

//! Manifest document format and its migrations
//!
//! The on-disk document carries a `schemaVersion`. Older documents are
//! upgraded one version at a time on the raw JSON value, and only then parsed
//! strictly into [`Manifest`]; unknown fields are rejected rather than
//! dropped. Documents from a newer cmam are refused.
//!
//! Version history:
//! - v1: `packages` is a list of entries that each carry their own `name`
//! - v2: `packages` is a map keyed by name; entries may reference a backup

use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::package::normalize_name;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Current manifest schema version
pub const MANIFEST_SCHEMA_VERSION: u32 = 2;

/// Reference from a manifest entry to its retained backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackupRef {
    pub path: PathBuf,
    pub sequence: u64,
}

/// Record of one installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstalledPackage {
    /// Filled from the map key; not part of the entry body
    #[serde(skip_serializing, default)]
    pub name: String,
    pub version: String,
    pub digest: Digest,
    pub install_path: PathBuf,
    /// RFC 3339, UTC
    pub installed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRef>,
}

impl InstalledPackage {
    pub fn new(name: &str, version: &str, digest: Digest, install_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            digest,
            install_path,
            installed_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            backup: None,
        }
    }
}

/// The set of installed packages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    pub schema_version: u32,
    pub packages: BTreeMap<String, InstalledPackage>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            packages: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&InstalledPackage> {
        self.packages.get(name)
    }

    /// Insert or replace the entry for `entry.name`
    pub fn insert(&mut self, entry: InstalledPackage) -> Option<InstalledPackage> {
        self.packages.insert(entry.name.clone(), entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<InstalledPackage> {
        self.packages.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstalledPackage> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Entry whose install path is `path`, if any
    pub fn owner_of(&self, path: &Path) -> Option<&InstalledPackage> {
        self.packages.values().find(|entry| entry.install_path == path)
    }

    /// Serialize in the current schema
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut current = self.clone();
        current.schema_version = MANIFEST_SCHEMA_VERSION;
        let mut bytes = serde_json::to_vec_pretty(&current)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Parse a manifest document, upgrading older schemas
///
/// Returns `Error::UnsupportedSchema` for documents from a newer cmam and
/// `Error::ParseError` for anything that is not a valid manifest.
pub fn parse(bytes: &[u8]) -> Result<Manifest> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::ParseError(format!("manifest is not valid JSON: {}", e)))?;

    let value = upgrade(value)?;

    let mut manifest: Manifest = serde_json::from_value(value)
        .map_err(|e| Error::ParseError(format!("manifest does not match schema: {}", e)))?;

    for (key, entry) in manifest.packages.iter_mut() {
        let normalized = normalize_name(key)
            .map_err(|_| Error::ParseError(format!("invalid package key '{}'", key)))?;
        if &normalized != key {
            return Err(Error::ParseError(format!(
                "package key '{}' is not normalized",
                key
            )));
        }
        entry.name = key.clone();
    }

    Ok(manifest)
}

/// Schema version a document declares
///
/// Documents written before versioning existed have no `schemaVersion` and
/// are treated as v1.
pub fn declared_version(value: &Value) -> Result<u32> {
    match value.get("schemaVersion") {
        None => Ok(1),
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= 1)
            .ok_or_else(|| Error::ParseError(format!("invalid schemaVersion {}", v))),
    }
}

fn upgrade(mut value: Value) -> Result<Value> {
    if !value.is_object() {
        return Err(Error::ParseError("manifest is not a JSON object".to_string()));
    }

    let found = declared_version(&value)?;
    if found > MANIFEST_SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            found,
            supported: MANIFEST_SCHEMA_VERSION,
        });
    }

    for version in found..MANIFEST_SCHEMA_VERSION {
        info!("Migrating manifest from schema version {}", version);
        value = match version {
            1 => migrate_v1(value)?,
            _ => {
                return Err(Error::ParseError(format!(
                    "no migration from manifest schema {}",
                    version
                )));
            }
        };
    }

    Ok(value)
}

/// v1 -> v2: list of named entries becomes a map keyed by name
fn migrate_v1(value: Value) -> Result<Value> {
    debug!("Converting manifest package list to map");

    let Value::Object(mut doc) = value else {
        return Err(Error::ParseError("manifest is not a JSON object".to_string()));
    };

    let list = match doc.remove("packages") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(list)) => list,
        Some(other) => {
            return Err(Error::ParseError(format!(
                "v1 packages must be a list, found {}",
                other
            )));
        }
    };

    let mut packages = Map::new();
    for item in list {
        let Value::Object(mut entry) = item else {
            return Err(Error::ParseError("v1 package entry is not an object".to_string()));
        };
        let name = match entry.remove("name") {
            Some(Value::String(name)) => normalize_name(&name)
                .map_err(|_| Error::ParseError(format!("invalid package name '{}'", name)))?,
            _ => return Err(Error::ParseError("v1 package entry has no name".to_string())),
        };
        if packages.insert(name.clone(), Value::Object(entry)).is_some() {
            return Err(Error::ParseError(format!(
                "package '{}' appears more than once",
                name
            )));
        }
    }

    doc.insert("schemaVersion".to_string(), Value::from(2));
    doc.insert("packages".to_string(), Value::Object(packages));
    Ok(Value::Object(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();
        manifest.insert(InstalledPackage::new(
            "tool",
            "1.0.0",
            hash::digest(b"tool"),
            PathBuf::from("/opt/cmam/scripts/tool"),
        ));
        manifest
    }

    #[test]
    fn test_serialized_form_is_keyed_by_name() {
        let bytes = sample().to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["schemaVersion"], 2);
        let entry = &value["packages"]["tool"];
        assert_eq!(entry["version"], "1.0.0");
        assert!(entry["digest"].as_str().unwrap().starts_with("sha256:"));
        assert!(entry.get("name").is_none());
        assert!(entry.get("backup").is_none());

        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.get("tool").unwrap().name, "tool");
    }

    #[test]
    fn test_v1_list_is_migrated() {
        let digest = hash::digest(b"tool");
        let doc = format!(
            r#"{{"schemaVersion": 1, "packages": [
                {{"name": "Tool", "version": "0.9", "digest": "{}",
                  "installPath": "/x/tool", "installedAt": "2024-01-01T00:00:00Z"}}
            ]}}"#,
            digest
        );

        let manifest = parse(doc.as_bytes()).unwrap();
        assert_eq!(manifest.schema_version, MANIFEST_SCHEMA_VERSION);
        let entry = manifest.get("tool").unwrap();
        assert_eq!(entry.version, "0.9");
        assert_eq!(entry.digest, digest);
        assert!(entry.backup.is_none());
    }

    #[test]
    fn test_unversioned_document_is_v1() {
        let manifest = parse(br#"{"packages": []}"#).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_future_schema_is_refused() {
        let err = parse(br#"{"schemaVersion": 99, "packages": {}}"#).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedSchema {
                found: 99,
                supported: MANIFEST_SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn test_corrupt_documents_are_parse_errors() {
        for doc in [
            &b"{not json"[..],
            br#"[]"#,
            br#"{"schemaVersion": 2, "packages": {"tool": {"version": "1"}}}"#,
            br#"{"schemaVersion": 2, "packages": {}, "extra": true}"#,
            br#"{"schemaVersion": 2, "packages": {"Tool": {"version": "1", "digest": "sha256:00", "installPath": "/x", "installedAt": "t"}}}"#,
        ] {
            assert!(
                matches!(parse(doc), Err(Error::ParseError(_))),
                "{}",
                String::from_utf8_lossy(doc)
            );
        }
    }

    #[test]
    fn test_owner_of_path() {
        let manifest = sample();
        assert_eq!(
            manifest
                .owner_of(Path::new("/opt/cmam/scripts/tool"))
                .map(|e| e.name.as_str()),
            Some("tool")
        );
        assert!(manifest.owner_of(Path::new("/elsewhere")).is_none());
    }
}
