//! The single cast session of the process.
//!
//! `Disconnected -> Connecting -> Connected(phase) -> Disconnected`. Remote
//! status is only as fresh as the last explicit refresh; nothing polls in the
//! background except the connection heartbeat.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CastDeviceRegistry, LoadRequest, ReceiverConnector, ReceiverTransport};
use crate::config::CastConfig;
use crate::{
    mime_type_for, CastDevice, CasterError, MediaStatus, RemotePlayerState, Result,
    DEFAULT_MEDIA_RECEIVER_APP_ID,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    Idle,
    Loading,
    Playing,
    Paused,
    Buffering,
}

impl From<RemotePlayerState> for PlaybackPhase {
    fn from(state: RemotePlayerState) -> Self {
        match state {
            RemotePlayerState::Idle => PlaybackPhase::Idle,
            RemotePlayerState::Playing => PlaybackPhase::Playing,
            RemotePlayerState::Paused => PlaybackPhase::Paused,
            RemotePlayerState::Buffering => PlaybackPhase::Buffering,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected(PlaybackPhase),
}

/// Waits between status checks.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct CastSession {
    device: CastDevice,
    transport: Arc<dyn ReceiverTransport>,
    heartbeat: JoinHandle<()>,
}

impl Drop for CastSession {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Clears the in-flight flag when a load finishes, however it finishes.
struct LoadGuard<'a>(&'a AtomicBool);

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CastSessionManager {
    connector: Arc<dyn ReceiverConnector>,
    sleeper: Arc<dyn Sleeper>,
    config: CastConfig,
    http: reqwest::Client,
    session: Arc<tokio::sync::Mutex<Option<CastSession>>>,
    state: Arc<RwLock<SessionState>>,
    status: Arc<RwLock<MediaStatus>>,
    last_refresh: Arc<Mutex<Option<Instant>>>,
    loading: AtomicBool,
    registry: tokio::sync::Mutex<Option<CastDeviceRegistry>>,
}

impl CastSessionManager {
    pub fn new(connector: Arc<dyn ReceiverConnector>, config: CastConfig) -> Self {
        Self {
            connector,
            sleeper: Arc::new(TokioSleeper),
            config,
            http: reqwest::Client::new(),
            session: Arc::new(tokio::sync::Mutex::new(None)),
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            status: Arc::new(RwLock::new(MediaStatus::default())),
            last_refresh: Arc::new(Mutex::new(None)),
            loading: AtomicBool::new(false),
            registry: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Hands a running registry to the session so `disconnect` shuts it down.
    pub async fn adopt_registry(&self, registry: CastDeviceRegistry) {
        *self.registry.lock().await = Some(registry);
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Connected(_))
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub async fn device(&self) -> Option<CastDevice> {
        self.session.lock().await.as_ref().map(|s| s.device.clone())
    }

    fn set_phase(&self, phase: PlaybackPhase) {
        let mut state = self.state.write();
        if matches!(*state, SessionState::Connected(_)) {
            *state = SessionState::Connected(phase);
        }
    }

    fn record_status(&self, status: MediaStatus) {
        *self.status.write() = status;
        *self.last_refresh.lock() = Some(Instant::now());
    }

    async fn transport(&self) -> Result<Arc<dyn ReceiverTransport>> {
        self.current_transport().await.ok_or(CasterError::NotConnected)
    }

    async fn current_transport(&self) -> Option<Arc<dyn ReceiverTransport>> {
        self.session.lock().await.as_ref().map(|s| Arc::clone(&s.transport))
    }

    /// Connects straight to the device's address and waits for a heartbeat.
    pub async fn connect(&self, device: &CastDevice) -> Result<()> {
        let mut session = self.session.lock().await;

        if let Some(existing) = session.as_ref() {
            if existing.device.id == device.id {
                debug!("Already connected to {}", device.name);
                return Ok(());
            }
        }
        if let Some(old) = session.take() {
            info!("Dropping connection to {}", old.device.name);
            let _ = old.transport.close().await;
        }

        *self.state.write() = SessionState::Connecting;

        let transport = match self.connector.connect(device).await {
            Ok(transport) => transport,
            Err(e) => {
                *self.state.write() = SessionState::Disconnected;
                return Err(e);
            }
        };

        if let Err(e) = transport.ping().await {
            let _ = transport.close().await;
            *self.state.write() = SessionState::Disconnected;
            return Err(e);
        }

        let heartbeat = self.spawn_heartbeat(Arc::clone(&transport), device.name.clone());

        *session = Some(CastSession {
            device: device.clone(),
            transport,
            heartbeat,
        });
        self.record_status(MediaStatus::default());
        *self.state.write() = SessionState::Connected(PlaybackPhase::Idle);
        info!("Connected to {} ({}:{})", device.name, device.address, device.port);
        Ok(())
    }

    /// Pings the receiver periodically. The first missed ping ends the
    /// session as if `disconnect` had been called.
    fn spawn_heartbeat(&self, transport: Arc<dyn ReceiverTransport>, name: String) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let state = Arc::clone(&self.state);
        let status = Arc::clone(&self.status);
        let last_refresh = Arc::clone(&self.last_refresh);
        let period = self.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Err(e) = transport.ping().await else {
                    continue;
                };
                warn!("Heartbeat to {} failed, dropping session: {}", name, e);

                let mut slot = session.lock().await;
                let ours = slot
                    .as_ref()
                    .is_some_and(|s| same_transport(&s.transport, &transport));
                if !ours {
                    return;
                }
                let dead = slot.take();
                *status.write() = MediaStatus::default();
                *last_refresh.lock() = None;
                *state.write() = SessionState::Disconnected;
                drop(slot);

                if let Err(e) = transport.close().await {
                    debug!("Close after heartbeat loss failed: {}", e);
                }
                // Dropping the session aborts this task, so it goes last.
                drop(dead);
                return;
            }
        })
    }

    /// Loads `url` on the receiver and waits until it actually plays.
    ///
    /// `path` only picks the MIME type. Only one load may run at a time.
    pub async fn play_video(&self, path: &Path, url: &str) -> Result<()> {
        let transport = self.transport().await?;

        if self.loading.swap(true, Ordering::SeqCst) {
            return Err(CasterError::Busy);
        }
        let _guard = LoadGuard(&self.loading);

        self.set_phase(PlaybackPhase::Loading);
        let result = self.load_and_verify(transport.as_ref(), path, url).await;
        if result.is_err() {
            let state = self.status.read().player_state;
            self.set_phase(state.into());
        }
        result
    }

    async fn load_and_verify(&self, transport: &dyn ReceiverTransport, path: &Path, url: &str) -> Result<()> {
        match transport.running_app().await {
            Ok(Some(app)) if app.app_id != DEFAULT_MEDIA_RECEIVER_APP_ID => {
                info!("Quitting {} ({}) before loading", app.display_name, app.app_id);
                if let Err(e) = transport.quit_app(&app.session_id).await {
                    warn!("Could not quit {}, loading anyway: {}", app.display_name, e);
                }
                self.sleeper.sleep(self.config.foreign_app_grace()).await;
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read receiver status: {}", e),
        }

        let content_type = mime_type_for(path);
        self.check_reachable(url).await?;

        info!("Loading {} as {}", url, content_type);
        let status = transport
            .load(&LoadRequest {
                url: url.to_string(),
                content_type: content_type.to_string(),
            })
            .await?;
        self.record_status(status);

        self.verify_playback(transport).await
    }

    /// The receiver fetches the URL itself, so make sure it answers first.
    async fn check_reachable(&self, url: &str) -> Result<()> {
        match self.http.head(url).timeout(self.config.head_timeout()).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(CasterError::Network(format!(
                "Stream URL {} answered {}",
                url,
                response.status()
            ))),
            Err(e) => Err(CasterError::Network(format!(
                "Stream URL {} is not reachable ({}). Check that the firewall allows incoming \
                 connections to the stream server port.",
                url, e
            ))),
        }
    }

    async fn verify_playback(&self, transport: &dyn ReceiverTransport) -> Result<()> {
        let attempts = self.config.verify_attempts;

        for attempt in 1..=attempts {
            self.sleeper.sleep(self.config.verify_interval()).await;

            let status = match transport.media_status().await {
                Ok(status) => status,
                Err(e) => {
                    debug!("Status check {}/{} failed: {}", attempt, attempts, e);
                    continue;
                }
            };
            let state = status.player_state;
            self.record_status(status);
            debug!("Status check {}/{}: {:?}", attempt, attempts, state);

            if state.is_started() {
                info!("Playback started after {} checks", attempt);
                self.set_phase(state.into());
                return Ok(());
            }

            if attempt == self.config.nudge_attempt && state == RemotePlayerState::Idle {
                info!("Receiver still idle, sending play");
                if let Err(e) = transport.play().await {
                    warn!("Play nudge failed: {}", e);
                }
            }
        }

        warn!("Receiver never started playback");
        Err(CasterError::PlaybackNotStarted { attempts })
    }

    pub async fn pause(&self) -> Result<()> {
        let Some(transport) = self.current_transport().await else {
            debug!("Pause ignored, not connected");
            return Ok(());
        };
        transport.pause().await?;
        self.status.write().player_state = RemotePlayerState::Paused;
        self.set_phase(PlaybackPhase::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let Some(transport) = self.current_transport().await else {
            debug!("Resume ignored, not connected");
            return Ok(());
        };
        transport.play().await?;
        self.status.write().player_state = RemotePlayerState::Playing;
        self.set_phase(PlaybackPhase::Playing);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let Some(transport) = self.current_transport().await else {
            debug!("Stop ignored, not connected");
            return Ok(());
        };
        transport.stop().await?;
        self.record_status(MediaStatus::default());
        self.set_phase(PlaybackPhase::Idle);
        Ok(())
    }

    pub async fn seek(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(CasterError::Validation(format!("Cannot seek to {}", seconds)));
        }
        let transport = self.transport().await?;

        transport.ping().await?;
        transport.seek(seconds).await?;
        self.status.write().position = seconds;

        if let Err(e) = self.force_refresh(transport.as_ref()).await {
            warn!("Status refresh after seek failed: {}", e);
        }
        Ok(())
    }

    /// Volume in `0.0..=1.0`. Values outside are rejected, not clamped.
    pub async fn set_volume(&self, level: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&level) {
            return Err(CasterError::Validation(format!("Volume {} is outside 0.0..=1.0", level)));
        }
        match self.current_transport().await {
            Some(transport) => transport.set_volume(level as f32).await,
            None => Ok(()),
        }
    }

    pub fn media_status(&self) -> MediaStatus {
        self.status.read().clone()
    }

    /// Last known position in seconds.
    pub fn position(&self) -> f64 {
        self.status.read().position
    }

    pub fn duration(&self) -> Option<f64> {
        self.status.read().duration
    }

    /// True while the receiver holds a media session that can be resumed.
    pub fn has_live_media(&self) -> bool {
        self.is_connected() && self.status.read().media_session_id.is_some()
    }

    /// Asks the receiver for its status, at most once per refresh interval.
    pub async fn refresh_status(&self) -> Result<MediaStatus> {
        let Some(transport) = self.current_transport().await else {
            return Ok(self.media_status());
        };

        if let Some(last) = *self.last_refresh.lock() {
            if last.elapsed() < self.config.status_refresh_interval() {
                return Ok(self.media_status());
            }
        }
        self.force_refresh(transport.as_ref()).await
    }

    async fn force_refresh(&self, transport: &dyn ReceiverTransport) -> Result<MediaStatus> {
        let status = transport.media_status().await?;
        self.record_status(status.clone());
        if !self.is_loading() {
            self.set_phase(status.player_state.into());
        }
        Ok(status)
    }

    /// Closes the connection and stops any registry owned by the session.
    pub async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            info!("Disconnecting from {}", session.device.name);
            if let Err(e) = session.transport.close().await {
                debug!("Close failed: {}", e);
            }
        }

        if let Some(mut registry) = self.registry.lock().await.take() {
            if let Err(e) = registry.stop_discovery() {
                warn!("Failed to stop discovery: {}", e);
            }
        }

        *self.status.write() = MediaStatus::default();
        *self.last_refresh.lock() = None;
        *self.state.write() = SessionState::Disconnected;
        Ok(())
    }
}

fn same_transport(a: &Arc<dyn ReceiverTransport>, b: &Arc<dyn ReceiverTransport>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
