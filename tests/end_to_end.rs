//! Convert, serve and cast a Matroska file against an in-process receiver.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use vidcast::cache::ConversionCache;
use vidcast::config::CastConfig;
use vidcast::converter::{PlayableSource, Transcoder, VideoConverter};
use vidcast::media::{GpuVendor, HardwareCapabilities, HardwareEncoder};
use vidcast::network::{
    CastSessionManager, LoadRequest, PlaybackPhase, ReceiverConnector, ReceiverTransport, RunningApp,
    SessionState, Sleeper,
};
use vidcast::orchestrator::{PlayOutcome, PlaybackOrchestrator};
use vidcast::player::HeadlessPlayer;
use vidcast::server::RangeFileServer;
use vidcast::{CastDevice, MediaStatus, PlayMode, RemotePlayerState, Result};

/// Remux that copies bytes, like a stream copy would.
struct CopyTranscoder {
    remuxes: AtomicUsize,
}

#[async_trait]
impl Transcoder for CopyTranscoder {
    async fn is_available(&self) -> bool {
        true
    }

    async fn remux(&self, input: &Path, output: &Path) -> Result<()> {
        self.remuxes.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn reencode(&self, _input: &Path, _output: &Path, _encoder: HardwareEncoder) -> Result<()> {
        unreachable!("remux succeeds in these tests")
    }
}

/// Receiver that fetches the loaded URL like a real one and reports
/// BUFFERING from the second status poll on.
#[derive(Default)]
struct FetchingReceiver {
    loads: Mutex<Vec<LoadRequest>>,
    fetched: Mutex<Vec<u16>>,
    polls: AtomicUsize,
}

#[async_trait]
impl ReceiverTransport for FetchingReceiver {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn running_app(&self) -> Result<Option<RunningApp>> {
        Ok(None)
    }

    async fn quit_app(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    async fn load(&self, request: &LoadRequest) -> Result<MediaStatus> {
        self.loads.lock().push(request.clone());
        let response = reqwest::Client::new()
            .get(&request.url)
            .header("Range", "bytes=0-1023")
            .send()
            .await
            .map_err(|e| vidcast::CasterError::Network(e.to_string()))?;
        self.fetched.lock().push(response.status().as_u16());
        Ok(MediaStatus {
            content_id: Some(request.url.clone()),
            content_type: Some(request.content_type.clone()),
            media_session_id: Some(7),
            ..MediaStatus::default()
        })
    }

    async fn media_status(&self) -> Result<MediaStatus> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        let player_state = if poll == 0 { RemotePlayerState::Idle } else { RemotePlayerState::Buffering };
        Ok(MediaStatus {
            player_state,
            duration: Some(120.0),
            media_session_id: Some(7),
            ..MediaStatus::default()
        })
    }

    async fn play(&self) -> Result<()> {
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn seek(&self, _seconds: f64) -> Result<()> {
        Ok(())
    }

    async fn set_volume(&self, _level: f32) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct Connector(Arc<FetchingReceiver>);

#[async_trait]
impl ReceiverConnector for Connector {
    async fn connect(&self, _device: &CastDevice) -> Result<Arc<dyn ReceiverTransport>> {
        Ok(self.0.clone() as Arc<dyn ReceiverTransport>)
    }
}

struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

fn port() -> u16 {
    std::net::TcpListener::bind("0.0.0.0:8765")
        .or_else(|_| std::net::TcpListener::bind("0.0.0.0:0"))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_mkv_is_converted_served_and_cast() {
    let videos = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let source = videos.path().join("movie.mkv");
    std::fs::write(&source, vec![0x1a; 2_000_000]).unwrap();

    let transcoder = Arc::new(CopyTranscoder { remuxes: AtomicUsize::new(0) });
    let caps = HardwareCapabilities {
        gpu: GpuVendor::Amd,
        ffmpeg_available: true,
        encoders: vec![HardwareEncoder::Vaapi],
        ..HardwareCapabilities::none()
    };
    let cache = ConversionCache::with_config(cache_dir.path().to_path_buf(), 1 << 30, Duration::from_secs(86_400))
        .await
        .unwrap();
    let converter = Arc::new(VideoConverter::new(cache, caps, transcoder.clone()).await.unwrap());

    let receiver = Arc::new(FetchingReceiver::default());
    let session = Arc::new(
        CastSessionManager::new(Arc::new(Connector(receiver.clone())), CastConfig::default())
            .with_sleeper(Arc::new(NoSleep)),
    );
    let device = CastDevice::new(Uuid::new_v4(), "Bedroom", IpAddr::V4(Ipv4Addr::LOCALHOST), 8009);
    session.connect(&device).await.unwrap();

    let server = Arc::new(
        RangeFileServer::with_ports(vec![port()]).with_advertised_host(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    );
    let mut orchestrator = PlaybackOrchestrator::new(
        Box::new(HeadlessPlayer::new()),
        converter.clone() as Arc<dyn PlayableSource>,
        server.clone(),
        session.clone(),
    );

    orchestrator.load(&source).await.unwrap();
    orchestrator.switch_mode(PlayMode::Cast).await.unwrap();
    let outcome = orchestrator.play().await.unwrap();

    let PlayOutcome::CastStarted(start) = outcome else {
        panic!("expected a fresh cast start");
    };
    let name = start.served_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("movie_") && name.ends_with(".mp4"), "{}", name);
    assert_eq!(name.len(), "movie_".len() + 8 + ".mp4".len());
    assert!(start.served_path.exists());
    assert!(start.conversion_error.is_none());
    assert!(start.url.ends_with(&format!("/{}", name)));

    let head = reqwest::Client::new().head(&start.url).send().await.unwrap();
    assert_eq!(head.status(), 200);
    assert_eq!(head.headers()["accept-ranges"], "bytes");
    assert_eq!(head.headers()["content-length"], "2000000");

    assert_eq!(receiver.loads.lock()[0].content_type, "video/mp4");
    assert_eq!(*receiver.fetched.lock(), vec![206]);
    assert_eq!(receiver.polls.load(Ordering::SeqCst), 2);
    assert_eq!(session.state(), SessionState::Connected(PlaybackPhase::Buffering));
    assert!(orchestrator.is_standby_inhibited());

    // A second cast of the same file reuses the cached copy.
    let again = converter.ensure_playable(&source, None).await.unwrap();
    assert_eq!(again, start.served_path);
    assert_eq!(transcoder.remuxes.load(Ordering::SeqCst), 1);

    orchestrator.shutdown().await;
    assert!(!server.is_running().await);
    assert!(!session.is_connected());
    assert!(!orchestrator.is_standby_inhibited());
}
