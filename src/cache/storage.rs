use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use crate::infrastructure::error::{CacheError, ConfigError};
use crate::infrastructure::periodic::{spawn_periodic, PeriodicHandle};

const ENTRY_EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Filesystem cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Storage root; the store owns every file in it
    pub directory: PathBuf,
    /// Entries older than this are treated as absent
    pub max_age_millis: u64,
    /// Gzip entry files
    pub compression: bool,
    /// Interval for the background sweep started by `spawn_cleanup`
    pub cleanup_interval_millis: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".cache/batchcore"),
            max_age_millis: 24 * 60 * 60 * 1000, // 24 hours
            compression: false,
            cleanup_interval_millis: None,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_millis)
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        self.cleanup_interval_millis.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.directory.as_os_str().is_empty() {
            return Err(ConfigError::invalid("cache.directory", "must not be empty"));
        }
        if self.cleanup_interval_millis == Some(0) {
            return Err(ConfigError::invalid(
                "cache.cleanup_interval_millis",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// On-disk envelope, written
#[derive(Serialize)]
struct EntryRef<'a, T: ?Sized> {
    value: &'a T,
    written_at: DateTime<Utc>,
}

/// On-disk envelope, read back
#[derive(Deserialize)]
struct Entry<T> {
    value: T,
    written_at: DateTime<Utc>,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub expired: usize,
}

/// Result of a cleanup sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub expired_removed: usize,
    pub corrupt_removed: usize,
    /// Leftover temp files from interrupted writes
    pub temp_removed: usize,
}

/// TTL-based key/value cache persisted as one JSON file per key.
///
/// File names are the SHA-256 of the key, so any key string maps to a safe,
/// fixed-length path. Every failure is logged and absorbed: reads degrade to a
/// miss, writes are dropped.
#[derive(Debug)]
pub struct CacheStore {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Create the storage directory if needed. No-op when disabled.
    pub async fn init(&self) {
        if !self.config.enabled {
            return;
        }
        if let Err(err) = self.ensure_directory().await {
            warn!(error = %err, "cache directory unavailable");
        }
    }

    /// Path of the file backing `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.config
            .directory
            .join(format!("{}.{}", hash_key(key), ENTRY_EXTENSION))
    }

    /// Fresh cached value for `key`, or `None`.
    ///
    /// Expired and corrupt entries are deleted on the way. A value that does
    /// not deserialize into `T` is a miss but is left on disk.
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        if !self.config.enabled {
            return None;
        }

        let path = self.entry_path(key);
        let entry: Entry<serde_json::Value> = self.read_entry(&path).await?;

        if !self.is_fresh(entry.written_at) {
            debug!(key, written_at = %entry.written_at, "cache entry expired");
            self.remove_path(&path).await;
            return None;
        }

        match serde_json::from_value(entry.value) {
            Ok(value) => {
                debug!(key, "cache hit");
                Some(value)
            }
            Err(err) => {
                warn!(key, error = %err, "cached value has an unexpected shape, treating as miss");
                None
            }
        }
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub async fn set<T>(&self, key: &str, value: &T)
    where
        T: Serialize + ?Sized,
    {
        if !self.config.enabled {
            return;
        }
        if let Err(err) = self.write_entry(key, value).await {
            warn!(key, error = %err, "cache write failed");
        }
    }

    /// Delete the entry for `key`. Returns whether a file was removed.
    pub async fn remove(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.remove_path(&self.entry_path(key)).await
    }

    /// Whether a fresh entry exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        self.get::<IgnoredAny>(key).await.is_some()
    }

    /// Remove every entry. Returns the number of files deleted.
    pub async fn clear(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let mut removed = 0;
        for path in self.list_files().await {
            if is_entry_file(&path) || is_temp_file(&path) {
                if self.remove_path(&path).await {
                    removed += 1;
                }
            }
        }

        info!(removed, directory = %self.config.directory.display(), "cache cleared");
        removed
    }

    /// Sweep the directory and delete expired or unreadable entries.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if !self.config.enabled {
            return report;
        }

        let files = self.list_files().await;

        for path in files.iter().filter(|p| is_temp_file(p)) {
            if self.is_stale_temp(path).await && self.remove_path(path).await {
                report.temp_removed += 1;
            }
        }

        for path in files.into_iter().filter(|p| is_entry_file(p)) {
            report.scanned += 1;

            match self.read_header(&path).await {
                Ok(Some(written_at)) if self.is_fresh(written_at) => {}
                Ok(Some(_)) => {
                    if self.remove_path(&path).await {
                        report.expired_removed += 1;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "removing unreadable cache entry");
                    if self.remove_path(&path).await {
                        report.corrupt_removed += 1;
                    }
                }
            }
        }

        info!(
            scanned = report.scanned,
            expired_removed = report.expired_removed,
            corrupt_removed = report.corrupt_removed,
            temp_removed = report.temp_removed,
            "cache cleanup finished"
        );
        report
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        if !self.config.enabled {
            return stats;
        }

        for path in self.list_files().await.into_iter().filter(|p| is_entry_file(p)) {
            stats.entries += 1;
            if let Ok(metadata) = fs::metadata(&path).await {
                stats.total_bytes += metadata.len();
            }
            if let Ok(Some(written_at)) = self.read_header(&path).await {
                if !self.is_fresh(written_at) {
                    stats.expired += 1;
                }
            }
        }

        stats
    }

    /// Run [`CacheStore::cleanup`] every `interval` in the background.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> PeriodicHandle {
        let store = Arc::clone(self);
        spawn_periodic("cache-cleanup", interval, move || {
            let store = Arc::clone(&store);
            async move {
                store.cleanup().await;
            }
        })
    }

    // Private helper methods

    fn is_fresh(&self, written_at: DateTime<Utc>) -> bool {
        let age = self.clock.now().signed_duration_since(written_at);
        match chrono::Duration::from_std(self.config.max_age()) {
            Ok(max_age) => age <= max_age,
            // Outside chrono's range: nothing can be that old
            Err(_) => true,
        }
    }

    /// A temp file untouched for longer than `max_age` belongs to a write
    /// that never finished.
    async fn is_stale_temp(&self, path: &Path) -> bool {
        match fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => !self.is_fresh(DateTime::<Utc>::from(modified)),
            Err(_) => false,
        }
    }

    async fn ensure_directory(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.config.directory)
            .await
            .map_err(|source| CacheError::Directory {
                path: self.config.directory.clone(),
                source,
            })
    }

    /// Parsed envelope, or `None` on a miss. Corrupt files are deleted.
    async fn read_entry(&self, path: &Path) -> Option<Entry<serde_json::Value>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "cache miss");
                return None;
            }
            Err(source) => {
                let err = CacheError::Read {
                    path: path.to_path_buf(),
                    source,
                };
                warn!(error = %err, "cache read failed, treating as miss");
                return None;
            }
        };

        match decode_entry(path, &bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "discarding corrupt cache entry");
                self.remove_path(path).await;
                None
            }
        }
    }

    /// Write timestamp of an entry without materialising its value.
    async fn read_header(&self, path: &Path) -> Result<Option<DateTime<Utc>>, CacheError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            // Removed concurrently
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let entry: Entry<IgnoredAny> = decode_entry(path, &bytes)?;
        Ok(Some(entry.written_at))
    }

    async fn write_entry<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let envelope = EntryRef {
            value,
            written_at: self.clock.now(),
        };
        let json = serde_json::to_vec(&envelope).map_err(|source| CacheError::Serialize {
            key: key.to_string(),
            source,
        })?;

        let path = self.entry_path(key);
        let bytes = if self.config.compression {
            compress(&json).map_err(|source| CacheError::Write {
                path: path.clone(),
                source,
            })?
        } else {
            json
        };

        self.ensure_directory().await?;

        // Write aside and rename so readers never observe a partial file
        let temp_path = self.config.directory.join(format!(
            ".{}{}",
            Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));
        let write_result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::Write { path, source });
        }

        debug!(key, bytes = bytes.len(), compressed = self.config.compression, "cache entry written");
        Ok(())
    }

    async fn remove_path(&self, path: &Path) -> bool {
        match fs::remove_file(path).await {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to remove cache file");
                false
            }
        }
    }

    async fn list_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.config.directory).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return files,
            Err(source) => {
                let err = CacheError::Directory {
                    path: self.config.directory.clone(),
                    source,
                };
                warn!(error = %err, "cannot list cache directory");
                return files;
            }
        };

        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                    if is_file {
                        files.push(entry.path());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "cache directory listing interrupted");
                    break;
                }
            }
        }

        files
    }
}

/// Hex SHA-256 of a cache key.
pub fn hash_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

fn is_entry_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION)
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

fn decode_entry<T>(path: &Path, bytes: &[u8]) -> Result<Entry<T>, CacheError>
where
    T: DeserializeOwned,
{
    let json = if bytes.starts_with(&GZIP_MAGIC) {
        decompress(bytes).map_err(|source| CacheError::Read {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        bytes.to_vec()
    };

    serde_json::from_slice(&json).map_err(|source| CacheError::Deserialize {
        path: path.to_path_buf(),
        source,
    })
}

fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}
