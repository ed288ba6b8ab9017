use ring::digest::{digest, SHA256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CasterError, Result as CasterResult};

/// A converted file and the source it was produced from.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionCacheEntry {
    pub source: PathBuf,
    pub key: String,
    pub output: PathBuf,
    pub output_modified: SystemTime,
}

/// Any file found in the cache directory.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFile {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct EvictionReport {
    pub expired: usize,
    pub over_budget: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// On-disk cache of cast-compatible copies, one file per source path.
///
/// Files are named `<stem>_<hash>.mp4`, where the hash is taken over the
/// absolute source path, so each source maps to exactly one entry and
/// entries can be compared by mtime against their source.
#[derive(Debug)]
pub struct ConversionCache {
    cache_dir: PathBuf,
    max_size: u64,
    max_age: Duration,
}

impl ConversionCache {
    pub async fn new(config: &CacheConfig) -> CasterResult<Self> {
        Self::with_config(config.resolve_dir(), config.max_size_bytes(), config.max_age()).await
    }

    pub async fn with_config(cache_dir: PathBuf, max_size: u64, max_age: Duration) -> CasterResult<Self> {
        fs::create_dir_all(&cache_dir).await.map_err(|e| {
            CasterError::Cache(format!("Cannot create cache directory {}: {}", cache_dir.display(), e))
        })?;
        Ok(Self { cache_dir, max_size, max_age })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// First 8 hex digits of SHA-256 over the absolute source path.
    pub fn key_for(source: &Path) -> String {
        let absolute = std::path::absolute(source).unwrap_or_else(|_| source.to_path_buf());
        let hash = digest(&SHA256, absolute.to_string_lossy().as_bytes());
        hash.as_ref()[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn output_path(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        self.cache_dir.join(format!("{}_{}.mp4", stem, Self::key_for(source)))
    }

    /// The cached copy of `source` if it exists and is at least as new as the
    /// source. A stale copy is deleted so the caller regenerates it.
    pub async fn lookup(&self, source: &Path) -> CasterResult<Option<ConversionCacheEntry>> {
        let output = self.output_path(source);
        let output_meta = match fs::metadata(&output).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let source_modified = fs::metadata(source).await?.modified()?;
        let output_modified = output_meta.modified()?;

        if output_modified >= source_modified {
            debug!("Reusing cached conversion {}", output.display());
            return Ok(Some(ConversionCacheEntry {
                source: source.to_path_buf(),
                key: Self::key_for(source),
                output,
                output_modified,
            }));
        }

        info!("Cached conversion {} is older than its source, discarding", output.display());
        fs::remove_file(&output).await?;
        Ok(None)
    }

    pub async fn remove(&self, source: &Path) -> CasterResult<()> {
        match fs::remove_file(self.output_path(source)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All regular files in the cache directory.
    pub async fn files(&self) -> CasterResult<Vec<CachedFile>> {
        let mut files = Vec::new();
        let mut read_dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(CachedFile {
                path: entry.path(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: metadata.len(),
            });
        }
        Ok(files)
    }

    pub async fn total_size(&self) -> CasterResult<u64> {
        Ok(self.files().await?.iter().map(|f| f.size).sum())
    }

    pub async fn evict(&self) -> CasterResult<EvictionReport> {
        self.evict_at(SystemTime::now(), None).await
    }

    /// Eviction that never removes `keep`, used right after a conversion.
    pub async fn evict_keeping(&self, keep: &Path) -> CasterResult<EvictionReport> {
        self.evict_at(SystemTime::now(), Some(keep)).await
    }

    /// Drops files older than the max age, then the oldest files until the
    /// total fits the size budget.
    pub async fn evict_at(&self, now: SystemTime, keep: Option<&Path>) -> CasterResult<EvictionReport> {
        let mut report = EvictionReport::default();
        let mut files = self.files().await?;

        let mut kept = Vec::with_capacity(files.len());
        for file in files.drain(..) {
            let age = now.duration_since(file.modified).unwrap_or_default();
            if age > self.max_age && keep != Some(file.path.as_path()) {
                if Self::delete(&file).await {
                    report.expired += 1;
                    report.freed_bytes += file.size;
                    continue;
                }
            }
            kept.push(file);
        }

        kept.sort_by_key(|f| f.modified);
        let mut total: u64 = kept.iter().map(|f| f.size).sum();

        for file in &kept {
            if total <= self.max_size {
                break;
            }
            if keep == Some(file.path.as_path()) {
                continue;
            }
            if Self::delete(file).await {
                report.over_budget += 1;
                report.freed_bytes += file.size;
                total -= file.size;
            }
        }

        report.remaining_bytes = total;
        if report.expired + report.over_budget > 0 {
            info!(
                "Cache eviction removed {} expired and {} over-budget files ({} bytes)",
                report.expired, report.over_budget, report.freed_bytes
            );
        }
        Ok(report)
    }

    async fn delete(file: &CachedFile) -> bool {
        match fs::remove_file(&file.path).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to evict {}: {}", file.path.display(), e);
                false
            }
        }
    }
}
