//! Content-addressed cache store
//!
//! Blobs are gzip-compressed bincode manifests of the files a job asked to
//! persist. The store sits on top of a pluggable `CacheBackend` (local
//! directory or in-memory) and implements the restore policy: exact key
//! match preferred, else the stored key sharing the longest non-empty
//! common prefix with the request, most recent save winning ties. A miss
//! is never fatal; saves are last-writer-wins and atomic.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// One persisted file, path relative to the job workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheFileEntry {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// The unit a cache key addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub entries: Vec<CacheFileEntry>,
}

/// A restored blob together with the key it actually matched
#[derive(Debug, Clone)]
pub struct RestoredBlob {
    pub key: String,
    pub exact: bool,
    pub manifest: CacheManifest,
}

#[derive(Debug, Clone)]
pub struct CacheKeyInfo {
    pub key: String,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// Key/blob storage port
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), CacheError>;
    async fn keys(&self) -> Result<Vec<CacheKeyInfo>, CacheError>;
}

/// In-memory backend for tests and embedded use
#[derive(Debug, Default)]
pub struct MemoryCache {
    inner: RwLock<HashMap<String, (chrono::DateTime<chrono::Utc>, Vec<u8>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let inner = self.inner.read().await;
        Ok(inner.get(key).map(|(_, blob)| blob.clone()))
    }

    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        inner.insert(key.to_string(), (chrono::Utc::now(), blob));
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<CacheKeyInfo>, CacheError> {
        let inner = self.inner.read().await;
        Ok(inner
            .iter()
            .map(|(key, (saved_at, _))| CacheKeyInfo {
                key: key.clone(),
                saved_at: *saved_at,
            })
            .collect())
    }
}

/// Filesystem backend
///
/// Blob files are named by the SHA-256 of the key with a `.key` sidecar
/// holding the key text; writes go to a temp file first and are renamed
/// into place, so a concurrent get never observes a partial blob.
#[derive(Debug)]
pub struct LocalDirCache {
    dir: PathBuf,
}

impl LocalDirCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.blob", hash_key(key)))
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.key", hash_key(key)))
    }

    async fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let tmp = self.dir.join(format!(
            ".tmp-{}",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, target).await?;
        Ok(())
    }
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl CacheBackend for LocalDirCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match tokio::fs::read(self.blob_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.write_atomic(&self.blob_path(key), &blob).await?;
        self.write_atomic(&self.key_path(key), key.as_bytes())
            .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<CacheKeyInfo>, CacheError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(CacheError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("key") {
                continue;
            }
            let key = tokio::fs::read_to_string(&path).await?;
            let blob = path.with_extension("blob");
            let saved_at = match tokio::fs::metadata(&blob).await {
                Ok(meta) => meta
                    .modified()
                    .map(chrono::DateTime::<chrono::Utc>::from)
                    .unwrap_or_else(|_| chrono::Utc::now()),
                // sidecar without blob: a save in flight, skip it
                Err(_) => continue,
            };
            out.push(CacheKeyInfo { key, saved_at });
        }
        Ok(out)
    }
}

/// Cache store - restore/save semantics over a backend
pub struct CacheStore {
    backend: std::sync::Arc<dyn CacheBackend>,
    // serializes concurrent saves; last writer wins per key
    save_lock: Mutex<()>,
}

impl CacheStore {
    pub fn new(backend: std::sync::Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            save_lock: Mutex::new(()),
        }
    }

    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self::new(std::sync::Arc::new(LocalDirCache::new(dir)))
    }

    pub fn in_memory() -> Self {
        Self::new(std::sync::Arc::new(MemoryCache::new()))
    }

    /// Restore the blob for `key`
    ///
    /// Exact match first; otherwise the stored key sharing the longest
    /// non-empty common prefix, ties broken by most recent save. An
    /// unknown key yields `None`, not an error.
    pub async fn restore(&self, key: &str) -> Result<Option<RestoredBlob>, CacheError> {
        if let Some(blob) = self.backend.get(key).await? {
            debug!(key, "cache restore: exact hit");
            return Ok(Some(RestoredBlob {
                key: key.to_string(),
                exact: true,
                manifest: unpack(&blob)?,
            }));
        }

        let mut best: Option<(usize, CacheKeyInfo)> = None;
        for info in self.backend.keys().await? {
            let shared = common_prefix_len(key, &info.key);
            if shared == 0 {
                continue;
            }
            let better = match &best {
                None => true,
                Some((len, current)) => {
                    shared > *len || (shared == *len && info.saved_at > current.saved_at)
                }
            };
            if better {
                best = Some((shared, info));
            }
        }

        let Some((_, fallback)) = best else {
            debug!(key, "cache restore: miss");
            return Ok(None);
        };
        match self.backend.get(&fallback.key).await? {
            Some(blob) => {
                info!(key, matched = %fallback.key, "cache restore: prefix fallback");
                Ok(Some(RestoredBlob {
                    key: fallback.key.clone(),
                    exact: false,
                    manifest: unpack(&blob)?,
                }))
            }
            // evicted between listing and get; a miss, not an error
            None => Ok(None),
        }
    }

    /// Pack the files matching `paths` under `base_dir` and save them
    /// under `key` - unconditional overwrite, no merge
    pub async fn save(
        &self,
        key: &str,
        base_dir: &Path,
        paths: &[String],
    ) -> Result<usize, CacheError> {
        let _guard = self.save_lock.lock().await;
        let entries = collect_entries(base_dir, paths)?;
        let count = entries.len();
        let blob = pack(&CacheManifest { entries })?;
        self.backend.put(key, blob).await?;
        debug!(key, files = count, "cache save");
        Ok(count)
    }

    /// Unpack a restored manifest into `dest`, refusing path traversal
    pub async fn restore_into(
        &self,
        blob: &RestoredBlob,
        dest: &Path,
    ) -> Result<usize, CacheError> {
        let mut written = 0;
        for entry in &blob.manifest.entries {
            let rel = Path::new(&entry.path);
            if rel.is_absolute()
                || rel
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                warn!(path = %entry.path, "cache entry escapes the workspace, skipping");
                continue;
            }
            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &entry.bytes).await?;
            written += 1;
        }
        Ok(written)
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

/// gzip(bincode(manifest))
pub fn pack(manifest: &CacheManifest) -> Result<Vec<u8>, CacheError> {
    let encoded = bincode::serialize(manifest)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&encoded)?;
    Ok(encoder.finish()?)
}

pub fn unpack(blob: &[u8]) -> Result<CacheManifest, CacheError> {
    let mut decoder = GzDecoder::new(blob);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded)?;
    Ok(bincode::deserialize(&decoded)?)
}

/// Resolve path globs to concrete files under `base_dir`
///
/// A pattern without wildcards names a file or a directory (persisted
/// recursively); `*` in a pattern matches any run of characters in the
/// slash-normalized relative path.
fn collect_entries(base_dir: &Path, patterns: &[String]) -> Result<Vec<CacheFileEntry>, CacheError> {
    let mut entries = Vec::new();
    let mut wildcards = Vec::new();

    for pattern in patterns {
        if pattern.contains('*') {
            wildcards.push(pattern.as_str());
            continue;
        }
        let target = base_dir.join(pattern);
        if target.is_dir() {
            walk(base_dir, &target, &mut |rel, path| {
                push_entry(&mut entries, rel, path)
            })?;
        } else if target.is_file() {
            push_entry(&mut entries, pattern.clone(), &target)?;
        } else {
            debug!(pattern, "cache path matched nothing");
        }
    }

    if !wildcards.is_empty() {
        let mut matched = Vec::new();
        walk(base_dir, base_dir, &mut |rel, path| {
            if wildcards.iter().any(|p| wildcard_match(p, &rel)) {
                push_entry(&mut matched, rel, path)?;
            }
            Ok(())
        })?;
        entries.append(&mut matched);
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries.dedup_by(|a, b| a.path == b.path);
    Ok(entries)
}

fn push_entry(
    entries: &mut Vec<CacheFileEntry>,
    rel: String,
    path: &Path,
) -> Result<(), CacheError> {
    entries.push(CacheFileEntry {
        path: rel,
        bytes: std::fs::read(path)?,
    });
    Ok(())
}

fn walk(
    base: &Path,
    dir: &Path,
    f: &mut impl FnMut(String, &Path) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(base, &path, f)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            f(rel, &path)?;
        }
    }
    Ok(())
}

/// Files under `base` whose slash-relative path matches `pattern`
pub(crate) fn find_matches(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, CacheError> {
    let mut out = Vec::new();
    if !pattern.contains('*') {
        let path = base.join(pattern);
        if path.is_file() {
            out.push(path);
        }
        return Ok(out);
    }
    walk(base, base, &mut |rel, path| {
        if wildcard_match(pattern, &rel) {
            out.push(path.to_path_buf());
        }
        Ok(())
    })?;
    out.sort();
    Ok(out)
}

/// `*`-only wildcard match (two-pointer with backtracking)
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
