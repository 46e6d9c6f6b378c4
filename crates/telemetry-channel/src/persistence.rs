// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable overflow store for transmissions that could not be delivered.
//!
//! Each entry is one file named after its arrival sequence number, holding a
//! JSON header line followed by the raw payload bytes. The in-memory index is
//! rebuilt from the directory on open, so entries survive a restart.
//!
//! The sum of stored payload bytes never exceeds the quota: an insert that
//! would cross it evicts the oldest entries first.

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::stats::{self, ChannelStats};
use crate::transmission::Transmission;

const ENTRY_EXTENSION: &str = "trn";
const TMP_EXTENSION: &str = "tmp";

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    endpoint: String,
    content_type: String,
    content_encoding: Option<String>,
    created_at: DateTime<Utc>,
    attempt: u32,
    spilled_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    payload_len: u64,
}

/// A transmission read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
    pub key: u64,
    pub transmission: Transmission,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpillOutcome {
    Stored { key: u64, evicted: usize },
    /// The entry alone is larger than the whole quota.
    Dropped { size: u64, quota: u64 },
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    size: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Index {
    entries: BTreeMap<u64, IndexEntry>,
    used_bytes: u64,
    next_key: u64,
}

impl Index {
    fn insert(&mut self, key: u64, entry: IndexEntry) {
        self.used_bytes += entry.size;
        self.entries.insert(key, entry);
        self.next_key = self.next_key.max(key.saturating_add(1));
    }

    fn remove(&mut self, key: u64) -> Option<IndexEntry> {
        let entry = self.entries.remove(&key)?;
        self.used_bytes = self.used_bytes.saturating_sub(entry.size);
        Some(entry)
    }
}

#[derive(Debug)]
pub struct PersistenceFallback {
    dir: PathBuf,
    quota_bytes: u64,
    ttl: Duration,
    index: Mutex<Index>,
    stats: Arc<ChannelStats>,
}

impl PersistenceFallback {
    /// Opens the store, rebuilding the index from the directory.
    ///
    /// Leftover temporary files and unreadable entries are deleted.
    pub async fn open(
        config: &StorageConfig,
        stats: Arc<ChannelStats>,
    ) -> Result<Self, StorageError> {
        let dir = config.path.clone();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        let mut index = Index::default();
        let mut read_dir = fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        while let Some(dir_entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let path = dir_entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(TMP_EXTENSION) => {
                    debug!("CHANNEL | Removing incomplete entry {}", path.display());
                    remove_file(&path).await?;
                }
                Some(ENTRY_EXTENSION) => {
                    let Some(key) = parse_key(&path) else {
                        continue;
                    };
                    match read_entry(&path, key).await {
                        Ok(Some((header, _))) => index.insert(
                            key,
                            IndexEntry {
                                size: header.payload_len,
                                expires_at: header.expires_at,
                            },
                        ),
                        Ok(None) => {}
                        Err(e @ StorageError::Corrupt { .. }) => {
                            warn!("CHANNEL | Deleting unreadable entry: {e}");
                            remove_file(&path).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => {}
            }
        }

        let store = PersistenceFallback {
            dir,
            quota_bytes: config.quota_bytes,
            ttl: config.ttl,
            index: Mutex::new(index),
            stats,
        };
        {
            let mut index = store.index.lock().await;
            store.evict_until_fits(&mut index, 0).await?;
            debug!(
                "CHANNEL | Opened persistence store at {} with {} entries ({} bytes)",
                store.dir.display(),
                index.entries.len(),
                index.used_bytes
            );
        }
        Ok(store)
    }

    /// Persists a transmission, evicting the oldest entries when the quota
    /// would be exceeded.
    pub async fn spill(&self, transmission: &Transmission) -> Result<SpillOutcome, StorageError> {
        let size = transmission.size() as u64;
        if size > self.quota_bytes {
            warn!(
                "CHANNEL | Dropping transmission of {size} bytes, larger than the {} byte storage quota",
                self.quota_bytes
            );
            return Ok(SpillOutcome::Dropped {
                size,
                quota: self.quota_bytes,
            });
        }

        let mut index = self.index.lock().await;
        let key = index.next_key;
        let spilled_at = Utc::now();
        let expires_at = TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| spilled_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let header = EntryHeader {
            endpoint: transmission.endpoint().to_string(),
            content_type: transmission.content_type().to_string(),
            content_encoding: transmission.content_encoding().map(str::to_string),
            created_at: transmission.created_at(),
            attempt: transmission.attempt(),
            spilled_at,
            expires_at,
            payload_len: size,
        };
        let mut contents = serde_json::to_vec(&header).map_err(|e| StorageError::Corrupt {
            path: self.entry_path(key),
            reason: e.to_string(),
        })?;
        contents.push(b'\n');
        contents.extend_from_slice(transmission.payload());

        let tmp_path = self.dir.join(format!("{key:020}.{TMP_EXTENSION}"));
        let path = self.entry_path(key);
        if let Err(e) = fs::write(&tmp_path, &contents).await {
            discard_tmp(&tmp_path).await;
            return Err(StorageError::io(&tmp_path, e));
        }

        // Old entries go only once the new one is safely on disk.
        let evicted = match self.evict_until_fits(&mut index, size).await {
            Ok(evicted) => evicted,
            Err(e) => {
                discard_tmp(&tmp_path).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            discard_tmp(&tmp_path).await;
            return Err(StorageError::io(&path, e));
        }

        index.insert(key, IndexEntry { size, expires_at });
        debug!(
            "CHANNEL | Stored transmission {key} ({size} bytes), store now holds {} bytes",
            index.used_bytes
        );
        Ok(SpillOutcome::Stored { key, evicted })
    }

    /// Keys of every stored entry, oldest first.
    pub async fn keys(&self) -> Vec<u64> {
        self.index.lock().await.entries.keys().copied().collect()
    }

    /// Reads one entry back. Missing or unreadable entries are dropped from
    /// the index and yield `None`.
    pub async fn load(&self, key: u64) -> Result<Option<PersistedEntry>, StorageError> {
        let mut index = self.index.lock().await;
        if !index.entries.contains_key(&key) {
            return Ok(None);
        }
        let path = self.entry_path(key);
        match read_entry(&path, key).await {
            Ok(Some((header, payload))) => {
                let endpoint = Url::parse(&header.endpoint).map_err(|e| StorageError::Corrupt {
                    path: path.clone(),
                    reason: format!("invalid endpoint: {e}"),
                });
                match endpoint {
                    Ok(endpoint) => Ok(Some(PersistedEntry {
                        key,
                        expires_at: header.expires_at,
                        transmission: Transmission::from_parts(
                            endpoint,
                            payload,
                            header.content_type,
                            header.content_encoding,
                            header.created_at,
                            header.attempt,
                        ),
                    })),
                    Err(e) => {
                        warn!("CHANNEL | Deleting unreadable entry: {e}");
                        index.remove(key);
                        remove_file(&path).await?;
                        Ok(None)
                    }
                }
            }
            Ok(None) => {
                index.remove(key);
                Ok(None)
            }
            Err(e @ StorageError::Corrupt { .. }) => {
                warn!("CHANNEL | Deleting unreadable entry: {e}");
                index.remove(key);
                remove_file(&path).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn remove(&self, key: u64) -> Result<bool, StorageError> {
        let mut index = self.index.lock().await;
        if index.remove(key).is_none() {
            return Ok(false);
        }
        remove_file(&self.entry_path(key)).await?;
        Ok(true)
    }

    /// Deletes every entry whose expiry is at or before `now`.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut index = self.index.lock().await;
        let expired: Vec<u64> = index
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            index.remove(*key);
            remove_file(&self.entry_path(*key)).await?;
        }
        if !expired.is_empty() {
            stats::add(&self.stats.dropped_expired, expired.len() as u64);
            debug!("CHANNEL | Removed {} expired entries", expired.len());
        }
        Ok(expired.len())
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.entries.is_empty()
    }

    pub async fn used_bytes(&self) -> u64 {
        self.index.lock().await.used_bytes
    }

    #[must_use]
    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    async fn evict_until_fits(&self, index: &mut Index, incoming: u64) -> Result<usize, StorageError> {
        let mut evicted = 0;
        while index.used_bytes + incoming > self.quota_bytes {
            let Some((&oldest, _)) = index.entries.iter().next() else {
                break;
            };
            index.remove(oldest);
            remove_file(&self.entry_path(oldest)).await?;
            evicted += 1;
            debug!(
                "CHANNEL | Storage quota of {} bytes exceeded, evicted oldest entry {oldest}",
                self.quota_bytes
            );
        }
        if evicted > 0 {
            stats::add(&self.stats.evicted, evicted as u64);
        }
        Ok(evicted)
    }

    fn entry_path(&self, key: u64) -> PathBuf {
        self.dir.join(format!("{key:020}.{ENTRY_EXTENSION}"))
    }
}

/// The last key is reserved so the next key always exists.
fn parse_key(path: &Path) -> Option<u64> {
    path.file_stem()?
        .to_str()?
        .parse()
        .ok()
        .filter(|key| *key < u64::MAX)
}

/// `Ok(None)` when the file vanished underneath us.
async fn read_entry(path: &Path, key: u64) -> Result<Option<(EntryHeader, Bytes)>, StorageError> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let corrupt = |reason: String| StorageError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let split = contents
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt(format!("entry {key} has no header line")))?;
    let header: EntryHeader = serde_json::from_slice(&contents[..split])
        .map_err(|e| corrupt(format!("invalid header: {e}")))?;
    let payload = Bytes::copy_from_slice(&contents[split + 1..]);
    if payload.len() as u64 != header.payload_len {
        return Err(corrupt(format!(
            "expected {} payload bytes, found {}",
            header.payload_len,
            payload.len()
        )));
    }
    Ok(Some((header, payload)))
}

async fn discard_tmp(path: &Path) {
    if let Err(e) = remove_file(path).await {
        warn!("CHANNEL | Failed to clean up incomplete entry: {e}");
    }
}

async fn remove_file(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{Payload, CONTENT_TYPE};
    use tempfile::TempDir;

    fn transmission(size: usize) -> Transmission {
        Transmission::new(
            Url::parse("https://dc.example.com/v2/track").unwrap(),
            Payload {
                bytes: Bytes::from(vec![b'x'; size]),
                content_type: CONTENT_TYPE,
                content_encoding: Some("gzip"),
                record_count: 1,
            },
        )
    }

    fn storage_config(dir: &TempDir, quota_bytes: u64) -> StorageConfig {
        StorageConfig {
            quota_bytes,
            ..StorageConfig::new(dir.path())
        }
    }

    async fn open(dir: &TempDir, quota_bytes: u64) -> (PersistenceFallback, Arc<ChannelStats>) {
        let stats = Arc::new(ChannelStats::default());
        let store = PersistenceFallback::open(&storage_config(dir, quota_bytes), Arc::clone(&stats))
            .await
            .unwrap();
        (store, stats)
    }

    #[tokio::test]
    async fn test_quota_evicts_oldest_first() {
        let dir = TempDir::new().unwrap();
        let (store, stats) = open(&dir, 100).await;

        let first = store.spill(&transmission(60)).await.unwrap();
        assert_eq!(first, SpillOutcome::Stored { key: 0, evicted: 0 });

        let second = store.spill(&transmission(80)).await.unwrap();
        assert_eq!(second, SpillOutcome::Stored { key: 1, evicted: 1 });

        assert_eq!(store.keys().await, vec![1]);
        assert_eq!(store.used_bytes().await, 80);
        assert_eq!(stats.snapshot().evicted, 1);
        assert!(!dir.path().join(format!("{:020}.trn", 0)).exists());
    }

    #[tokio::test]
    async fn test_eviction_removes_only_what_is_needed() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir, 100).await;
        for _ in 0..4 {
            store.spill(&transmission(25)).await.unwrap();
        }
        let outcome = store.spill(&transmission(40)).await.unwrap();
        assert_eq!(outcome, SpillOutcome::Stored { key: 4, evicted: 2 });
        assert_eq!(store.keys().await, vec![2, 3, 4]);
        assert!(store.used_bytes().await <= 100);
    }

    #[tokio::test]
    async fn test_entry_larger_than_quota_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir, 100).await;
        store.spill(&transmission(50)).await.unwrap();

        let outcome = store.spill(&transmission(101)).await.unwrap();
        assert_eq!(outcome, SpillOutcome::Dropped { size: 101, quota: 100 });
        assert_eq!(store.keys().await, vec![0]);
    }

    #[tokio::test]
    async fn test_load_round_trips_transmission() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir, 1024).await;
        let mut original = transmission(10);
        original.next_attempt();
        original.next_attempt();

        store.spill(&original).await.unwrap();
        let entry = store.load(0).await.unwrap().unwrap();
        assert_eq!(entry.key, 0);
        assert_eq!(entry.transmission, original);
        assert!(entry.expires_at > Utc::now() + TimeDelta::hours(47));
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        {
            let (store, _) = open(&dir, 1024).await;
            store.spill(&transmission(10)).await.unwrap();
            store.spill(&transmission(20)).await.unwrap();
        }
        std::fs::write(dir.path().join("00000000000000000007.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("00000000000000000005.trn"), b"no header").unwrap();

        let (store, _) = open(&dir, 1024).await;
        assert_eq!(store.keys().await, vec![0, 1]);
        assert_eq!(store.used_bytes().await, 30);
        assert!(!dir.path().join("00000000000000000007.tmp").exists());
        assert!(!dir.path().join("00000000000000000005.trn").exists());

        let outcome = store.spill(&transmission(5)).await.unwrap();
        assert_eq!(outcome, SpillOutcome::Stored { key: 2, evicted: 0 });
    }

    #[tokio::test]
    async fn test_reopen_with_smaller_quota_evicts() {
        let dir = TempDir::new().unwrap();
        {
            let (store, _) = open(&dir, 1024).await;
            for _ in 0..3 {
                store.spill(&transmission(40)).await.unwrap();
            }
        }
        let (store, stats) = open(&dir, 100).await;
        assert_eq!(store.keys().await, vec![1, 2]);
        assert_eq!(stats.snapshot().evicted, 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_older_entries() {
        let dir = TempDir::new().unwrap();
        let (store, stats) = open(&dir, 100).await;
        store.spill(&transmission(60)).await.unwrap();

        // A directory where the next temp file should go makes the write fail.
        std::fs::create_dir(dir.path().join(format!("{:020}.tmp", 1))).unwrap();
        let result = store.spill(&transmission(80)).await;
        assert!(matches!(result, Err(StorageError::Io { .. })));

        assert_eq!(store.keys().await, vec![0]);
        assert_eq!(store.used_bytes().await, 60);
        assert_eq!(stats.snapshot().evicted, 0);
        assert!(dir.path().join(format!("{:020}.trn", 0)).exists());
    }

    #[tokio::test]
    async fn test_largest_key_on_disk_is_ignored() {
        let dir = TempDir::new().unwrap();
        let stray = dir.path().join(format!("{}.trn", u64::MAX));
        std::fs::write(&stray, b"{}\n").unwrap();

        let (store, _) = open(&dir, 1024).await;
        assert!(store.is_empty().await);
        let outcome = store.spill(&transmission(5)).await.unwrap();
        assert_eq!(outcome, SpillOutcome::Stored { key: 0, evicted: 0 });
        assert!(stray.exists());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let dir = TempDir::new().unwrap();
        let (store, stats) = open(&dir, 1024).await;
        store.spill(&transmission(10)).await.unwrap();
        store.spill(&transmission(10)).await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + TimeDelta::hours(49);
        assert_eq!(store.purge_expired(later).await.unwrap(), 2);
        assert!(store.is_empty().await);
        assert_eq!(store.used_bytes().await, 0);
        assert_eq!(stats.snapshot().dropped_expired, 2);
    }

    #[tokio::test]
    async fn test_remove_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir, 1024).await;
        store.spill(&transmission(10)).await.unwrap();
        store.spill(&transmission(10)).await.unwrap();

        assert!(store.remove(0).await.unwrap());
        assert!(!store.remove(0).await.unwrap());

        std::fs::remove_file(dir.path().join(format!("{:020}.trn", 1))).unwrap();
        assert!(store.load(1).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }
}
