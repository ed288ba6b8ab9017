//! Turns any source file into something a receiver can play.
//!
//! MP4-family files pass straight through. Matroska and AVI are remuxed into
//! MP4 and kept in the [`ConversionCache`], falling back to a hardware
//! re-encode when the streams cannot be copied.

pub mod ffmpeg;

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::ConversionCache;
use crate::media::HardwareCapabilities;
use crate::{needs_conversion, CasterError, Result};

pub use ffmpeg::{FfmpegTranscoder, Transcoder};

/// Receives human-readable progress lines during a conversion.
pub type ProgressSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Anything that can hand back a cast-compatible path for a source file.
#[async_trait]
pub trait PlayableSource: Send + Sync {
    async fn ensure_playable(&self, source: &Path, progress: Option<ProgressSink>) -> Result<PathBuf>;
}

pub struct VideoConverter {
    cache: ConversionCache,
    capabilities: HardwareCapabilities,
    transcoder: Arc<dyn Transcoder>,
    locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl VideoConverter {
    /// Builds the converter and runs one eviction pass over the cache.
    pub async fn new(
        cache: ConversionCache,
        capabilities: HardwareCapabilities,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self> {
        if let Err(e) = cache.evict().await {
            warn!("Cache eviction failed: {}", e);
        }
        Ok(Self {
            cache,
            capabilities,
            transcoder,
            locks: DashMap::new(),
        })
    }

    pub fn cache(&self) -> &ConversionCache {
        &self.cache
    }

    pub fn capabilities(&self) -> &HardwareCapabilities {
        &self.capabilities
    }

    fn lock_for(&self, source: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(source.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn convert(&self, source: &Path, output: &Path, progress: Option<&ProgressSink>) -> Result<()> {
        let report = |msg: &str| {
            if let Some(sink) = progress {
                sink(msg);
            }
        };

        if !self.transcoder.is_available().await {
            return Err(CasterError::Conversion("ffmpeg is not installed".into()));
        }

        report("Converting to MP4...");
        let remux_err = match self.transcoder.remux(source, output).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!("Remux of {} failed, trying re-encode: {}", source.display(), remux_err);
        discard(output).await;

        let Some(encoder) = self.capabilities.preferred_encoder() else {
            return Err(CasterError::NoHardwareEncoder);
        };

        report(&format!("Re-encoding with {}...", encoder.ffmpeg_name()));
        if let Err(e) = self.transcoder.reencode(source, output, encoder).await {
            discard(output).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl PlayableSource for VideoConverter {
    async fn ensure_playable(&self, source: &Path, progress: Option<ProgressSink>) -> Result<PathBuf> {
        if !needs_conversion(source) {
            return Ok(source.to_path_buf());
        }

        if !tokio::fs::try_exists(source).await? {
            return Err(CasterError::NotFound(source.display().to_string()));
        }

        let key = std::path::absolute(source).unwrap_or_else(|_| source.to_path_buf());
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(entry) = self.cache.lookup(source).await? {
            return Ok(entry.output);
        }

        let output = self.cache.output_path(source);
        self.convert(source, &output, progress.as_ref()).await?;

        if !tokio::fs::try_exists(&output).await? {
            return Err(CasterError::Conversion(format!(
                "Converter reported success but {} is missing",
                output.display()
            )));
        }

        if let Some(sink) = &progress {
            sink("Conversion complete");
        }
        info!("Converted {} -> {}", source.display(), output.display());

        if let Err(e) = self.cache.evict_keeping(&output).await {
            warn!("Cache eviction failed: {}", e);
        }
        Ok(output)
    }
}

async fn discard(output: &Path) {
    if let Err(e) = tokio::fs::remove_file(output).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial output {}: {}", output.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{GpuVendor, HardwareEncoder};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    #[derive(Default)]
    struct FakeTranscoder {
        remux_calls: AtomicUsize,
        reencode_calls: AtomicUsize,
        fail_remux: bool,
        fail_reencode: bool,
        encoders_used: Mutex<Vec<HardwareEncoder>>,
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn is_available(&self) -> bool {
            true
        }

        async fn remux(&self, _input: &Path, output: &Path) -> Result<()> {
            self.remux_calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(output, b"partial").await?;
            if self.fail_remux {
                return Err(CasterError::Conversion("unsupported codec".into()));
            }
            tokio::fs::write(output, b"remuxed").await?;
            Ok(())
        }

        async fn reencode(&self, _input: &Path, output: &Path, encoder: HardwareEncoder) -> Result<()> {
            self.reencode_calls.fetch_add(1, Ordering::SeqCst);
            self.encoders_used.lock().push(encoder);
            tokio::fs::write(output, b"partial").await?;
            if self.fail_reencode {
                return Err(CasterError::Conversion("encoder crashed".into()));
            }
            tokio::fs::write(output, b"encoded").await?;
            Ok(())
        }
    }

    fn vaapi_caps() -> HardwareCapabilities {
        HardwareCapabilities {
            gpu: GpuVendor::Amd,
            ffmpeg_available: true,
            encoders: vec![HardwareEncoder::Vaapi],
            ..HardwareCapabilities::none()
        }
    }

    async fn converter(
        dir: &Path,
        caps: HardwareCapabilities,
        transcoder: Arc<FakeTranscoder>,
    ) -> VideoConverter {
        let cache = ConversionCache::with_config(dir.join("cache"), 1 << 30, Duration::from_secs(3600))
            .await
            .unwrap();
        VideoConverter::new(cache, caps, transcoder).await.unwrap()
    }

    fn source(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"matroska bytes").unwrap();
        path
    }

    #[tokio::test]
    async fn test_mp4_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeTranscoder::default());
        let conv = converter(dir.path(), vaapi_caps(), fake.clone()).await;
        let mp4 = source(dir.path(), "movie.mp4");

        assert_eq!(conv.ensure_playable(&mp4, None).await.unwrap(), mp4);
        assert_eq!(fake.remux_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_output_is_reused_until_source_changes() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeTranscoder::default());
        let conv = converter(dir.path(), vaapi_caps(), fake.clone()).await;
        let mkv = source(dir.path(), "movie.mkv");

        let first = conv.ensure_playable(&mkv, None).await.unwrap();
        let second = conv.ensure_playable(&mkv, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.remux_calls.load(Ordering::SeqCst), 1);

        std::fs::File::options()
            .write(true)
            .open(&mkv)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        let third = conv.ensure_playable(&mkv, None).await.unwrap();
        assert_eq!(third, first);
        assert_eq!(fake.remux_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remux_failure_falls_back_to_hardware_encode() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeTranscoder { fail_remux: true, ..Default::default() });
        let conv = converter(dir.path(), vaapi_caps(), fake.clone()).await;
        let mkv = source(dir.path(), "movie.mkv");

        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink_messages = messages.clone();
        let sink: ProgressSink = Arc::new(move |m: &str| sink_messages.lock().push(m.to_string()));

        let out = conv.ensure_playable(&mkv, Some(sink)).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"encoded");
        assert_eq!(*fake.encoders_used.lock(), vec![HardwareEncoder::Vaapi]);
        assert!(messages.lock().iter().any(|m| m.contains("h264_vaapi")));
    }

    #[tokio::test]
    async fn test_no_hardware_encoder_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeTranscoder { fail_remux: true, ..Default::default() });
        let conv = converter(dir.path(), HardwareCapabilities::none(), fake.clone()).await;
        let mkv = source(dir.path(), "movie.avi");

        let err = conv.ensure_playable(&mkv, None).await.unwrap_err();
        assert!(matches!(err, CasterError::NoHardwareEncoder));
        assert!(!conv.cache().output_path(&mkv).exists());
        assert_eq!(fake.reencode_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_reencode_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeTranscoder {
            fail_remux: true,
            fail_reencode: true,
            ..Default::default()
        });
        let conv = converter(dir.path(), vaapi_caps(), fake).await;
        let mkv = source(dir.path(), "movie.mkv");

        assert!(conv.ensure_playable(&mkv, None).await.is_err());
        assert!(!conv.cache().output_path(&mkv).exists());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let conv = converter(dir.path(), vaapi_caps(), Arc::new(FakeTranscoder::default())).await;
        let err = conv.ensure_playable(&dir.path().join("gone.mkv"), None).await.unwrap_err();
        assert!(matches!(err, CasterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_requests_convert_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeTranscoder::default());
        let conv = Arc::new(converter(dir.path(), vaapi_caps(), fake.clone()).await);
        let mkv = source(dir.path(), "movie.mkv");

        let a = {
            let conv = conv.clone();
            let mkv = mkv.clone();
            tokio::spawn(async move { conv.ensure_playable(&mkv, None).await })
        };
        let b = {
            let conv = conv.clone();
            let mkv = mkv.clone();
            tokio::spawn(async move { conv.ensure_playable(&mkv, None).await })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, b);
        assert_eq!(fake.remux_calls.load(Ordering::SeqCst), 1);
    }
}
