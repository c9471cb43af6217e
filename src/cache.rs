// src/cache.rs

//! Content-addressed artifact cache
//!
//! Files live at `<root>/.cache/<hex digest>` and are only ever placed there
//! after their bytes hashed to that digest, so identical artifacts dedupe and
//! a cache hit needs no metadata beyond the digest. In-flight downloads are
//! temp files under `.cache/tmp` that vanish on drop.
//!
//! Size and last access are indexed in the cmam database for the cleaner.
//! The index is advisory: a failing index never fails a fetch.

use crate::db;
use crate::db::models::CacheRecord;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::hash::{self, Digest};
use crate::layout::Layout;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Temp files older than this are abandoned downloads
const STALE_TEMP_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// A verified artifact in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub digest: Digest,
    pub path: PathBuf,
    pub size: u64,
    /// RFC 3339, UTC
    pub last_access: String,
}

/// Eviction limits for [`CacheStore::clean`]
#[derive(Debug, Clone, Copy)]
pub struct CleanPolicy {
    pub max_age: Duration,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub removed: Vec<Digest>,
    pub freed_bytes: u64,
    pub stale_temp_files: usize,
    pub kept: usize,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    tmp_dir: PathBuf,
    db_path: PathBuf,
}

impl CacheStore {
    pub fn new(layout: &Layout) -> Self {
        Self {
            dir: layout.cache_dir(),
            tmp_dir: layout.cache_tmp_dir(),
            db_path: layout.database_path(),
        }
    }

    pub fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.hex())
    }

    /// Find a cached artifact, re-verifying its bytes
    ///
    /// A cached file that no longer matches its name is evicted and treated
    /// as a miss.
    pub fn lookup(&self, digest: &Digest) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(digest);
        let Some(actual) = hash::digest_file_if_exists(&path)? else {
            return Ok(None);
        };

        if &actual != digest {
            warn!(
                "Cached artifact {} is corrupt (hashes to {}), evicting",
                digest.short(),
                actual.short()
            );
            fsutil::remove_file_if_exists(&path)?;
            self.with_index(|conn| CacheRecord::delete(conn, digest.hex()));
            return Ok(None);
        }

        let size = file_size(&path)?;
        let now = now_stamp();
        self.with_index(|conn| {
            CacheRecord::new(digest.hex().to_string(), size as i64, now.clone()).upsert(conn)
        });

        debug!("Cache hit for {}", digest.short());
        Ok(Some(CacheEntry {
            digest: digest.clone(),
            path,
            size,
            last_access: now,
        }))
    }

    /// A fresh temp file for an in-flight download
    pub fn temp_file(&self) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.tmp_dir).map_err(|e| {
            Error::io(format!("Failed to create {}", self.tmp_dir.display()), e)
        })?;
        tempfile::Builder::new()
            .prefix("download-")
            .tempfile_in(&self.tmp_dir)
            .map_err(|e| Error::io(format!("Failed to create temp file in {}", self.tmp_dir.display()), e))
    }

    /// Move a downloaded temp file into the cache
    ///
    /// `actual` is the digest computed while the download was written. On
    /// mismatch the temp file is dropped (and deleted) and nothing is
    /// retained.
    pub fn admit(&self, temp: NamedTempFile, actual: &Digest, expected: &Digest) -> Result<CacheEntry> {
        if actual != expected {
            return Err(Error::ChecksumMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        temp.as_file()
            .sync_all()
            .map_err(|e| Error::io("Failed to sync download", e))?;

        let path = self.entry_path(expected);
        temp.persist(&path).map_err(|e| {
            Error::io(format!("Failed to store {} in cache", path.display()), e.error)
        })?;

        let size = file_size(&path)?;
        let now = now_stamp();
        self.with_index(|conn| {
            CacheRecord::new(expected.hex().to_string(), size as i64, now.clone()).upsert(conn)
        });

        info!("Cached {} ({} bytes)", expected.short(), size);
        Ok(CacheEntry {
            digest: expected.clone(),
            path,
            size,
            last_access: now,
        })
    }

    /// Every cached artifact, least recently used first
    ///
    /// Index rows whose file has vanished are dropped along the way.
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut on_disk: HashMap<Digest, (PathBuf, u64, SystemTime)> = HashMap::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("Failed to list {}", self.dir.display()), e)),
        };
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io(format!("Failed to list {}", self.dir.display()), e))?;
            let Ok(digest) = Digest::parse(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            let meta = entry
                .metadata()
                .map_err(|e| Error::io(format!("Failed to stat {}", entry.path().display()), e))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            on_disk.insert(digest, (entry.path(), meta.len(), modified));
        }

        let indexed: HashMap<String, String> = self
            .with_index(|conn| {
                let records = CacheRecord::list_lru(conn)?;
                let mut known = HashMap::new();
                for record in records {
                    let present = Digest::parse(&record.digest)
                        .map(|d| on_disk.contains_key(&d))
                        .unwrap_or(false);
                    if present {
                        known.insert(record.digest, record.last_access);
                    } else {
                        debug!("Dropping cache index row for missing {}", record.digest);
                        CacheRecord::delete(conn, &record.digest)?;
                    }
                }
                Ok(known)
            })
            .unwrap_or_default();

        let mut list: Vec<CacheEntry> = on_disk
            .into_iter()
            .map(|(digest, (path, size, modified))| {
                let last_access = indexed
                    .get(digest.hex())
                    .cloned()
                    .unwrap_or_else(|| stamp(DateTime::<Utc>::from(modified)));
                CacheEntry {
                    digest,
                    path,
                    size,
                    last_access,
                }
            })
            .collect();
        list.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.digest.cmp(&b.digest))
        });
        Ok(list)
    }

    /// Evict by age, then by size, never touching `protect`
    ///
    /// Installed files are separate copies, so eviction never affects them;
    /// `protect` only keeps artifacts of installed versions warm.
    pub fn clean(&self, policy: &CleanPolicy, protect: &HashSet<Digest>) -> Result<CleanReport> {
        let mut report = CleanReport {
            stale_temp_files: self.sweep_temp_files()?,
            ..CleanReport::default()
        };

        let now = Utc::now();
        let max_age = chrono::Duration::from_std(policy.max_age).unwrap_or(chrono::Duration::MAX);

        let mut survivors = Vec::new();
        for entry in self.list()? {
            let expired = DateTime::parse_from_rfc3339(&entry.last_access)
                .map(|t| now.signed_duration_since(t) > max_age)
                .unwrap_or(false);
            if expired && !protect.contains(&entry.digest) {
                self.evict(&entry, &mut report)?;
            } else {
                survivors.push(entry);
            }
        }

        let mut total: u64 = survivors.iter().map(|e| e.size).sum();
        let mut kept = Vec::new();
        for entry in survivors {
            if total > policy.max_bytes && !protect.contains(&entry.digest) {
                total -= entry.size;
                self.evict(&entry, &mut report)?;
            } else {
                kept.push(entry);
            }
        }
        report.kept = kept.len();

        info!(
            "Cache clean removed {} artifacts ({} bytes), {} stale temp files",
            report.removed.len(),
            report.freed_bytes,
            report.stale_temp_files
        );
        Ok(report)
    }

    fn evict(&self, entry: &CacheEntry, report: &mut CleanReport) -> Result<()> {
        debug!("Evicting {} from cache", entry.digest.short());
        fsutil::remove_file_if_exists(&entry.path)?;
        self.with_index(|conn| CacheRecord::delete(conn, entry.digest.hex()));
        report.freed_bytes += entry.size;
        report.removed.push(entry.digest.clone());
        Ok(())
    }

    fn sweep_temp_files(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.tmp_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(Error::io(format!("Failed to list {}", self.tmp_dir.display()), e));
            }
        };

        let mut swept = 0;
        for entry in entries.flatten() {
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > STALE_TEMP_AGE);
            if stale && fsutil::remove_file_if_exists(&entry.path())? {
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Run an index operation, logging rather than propagating failures
    fn with_index<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Option<T> {
        match db::init(&self.db_path).and_then(|conn| db::transaction(&conn, |tx| f(tx))) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cache index unavailable: {}", e);
                None
            }
        }
    }
}

fn file_size(path: &std::path::Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::io(format!("Failed to stat {}", path.display()), e))
}

fn stamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_stamp() -> String {
    stamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn setup() -> (tempfile::TempDir, CacheStore) {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path());
        layout.ensure().unwrap();
        (temp, CacheStore::new(&layout))
    }

    fn put(cache: &CacheStore, bytes: &[u8]) -> CacheEntry {
        let mut temp = cache.temp_file().unwrap();
        temp.write_all(bytes).unwrap();
        let digest = hash::digest(bytes);
        cache.admit(temp, &digest, &digest).unwrap()
    }

    #[test]
    fn test_admit_then_lookup() {
        let (_temp, cache) = setup();
        let entry = put(&cache, b"artifact");

        assert_eq!(entry.size, 8);
        assert_eq!(fs::read(&entry.path).unwrap(), b"artifact");
        let hit = cache.lookup(&entry.digest).unwrap().unwrap();
        assert_eq!(hit.path, entry.path);
    }

    #[test]
    fn test_admit_rejects_mismatch() {
        let (_temp, cache) = setup();
        let mut temp = cache.temp_file().unwrap();
        temp.write_all(b"tampered").unwrap();
        let temp_path = temp.path().to_path_buf();
        let expected = hash::digest(b"original");

        let err = cache
            .admit(temp, &hash::digest(b"tampered"), &expected)
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!temp_path.exists());
        assert!(cache.lookup(&expected).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_is_evicted_on_lookup() {
        let (_temp, cache) = setup();
        let entry = put(&cache, b"artifact");
        fs::write(&entry.path, b"bit rot").unwrap();

        assert!(cache.lookup(&entry.digest).unwrap().is_none());
        assert!(!entry.path.exists());
    }

    #[test]
    fn test_clean_evicts_lru_down_to_limit() {
        let (_temp, cache) = setup();
        let old = put(&cache, b"aaaa");
        std::thread::sleep(Duration::from_millis(5));
        let newer = put(&cache, b"bbbb");
        std::thread::sleep(Duration::from_millis(5));
        let protected = put(&cache, b"cccc");

        let policy = CleanPolicy {
            max_age: Duration::from_secs(3600),
            max_bytes: 4,
        };
        let protect: HashSet<Digest> = [protected.digest.clone()].into_iter().collect();
        let report = cache.clean(&policy, &protect).unwrap();

        assert_eq!(report.removed, vec![old.digest.clone(), newer.digest.clone()]);
        assert_eq!(report.freed_bytes, 8);
        assert!(protected.path.exists());
        assert_eq!(cache.list().unwrap().len(), 1);
    }

    #[test]
    fn test_clean_evicts_expired() {
        let (_temp, cache) = setup();
        let entry = put(&cache, b"old");

        let policy = CleanPolicy {
            max_age: Duration::ZERO,
            max_bytes: u64::MAX,
        };
        std::thread::sleep(Duration::from_millis(5));
        let report = cache.clean(&policy, &HashSet::new()).unwrap();
        assert_eq!(report.removed, vec![entry.digest]);
    }

    #[test]
    fn test_list_drops_index_rows_for_missing_files() {
        let (_temp, cache) = setup();
        let entry = put(&cache, b"artifact");
        fs::remove_file(&entry.path).unwrap();

        assert!(cache.list().unwrap().is_empty());
        let conn = db::init(&cache.db_path).unwrap();
        assert!(CacheRecord::find(&conn, entry.digest.hex()).unwrap().is_none());
    }
}
