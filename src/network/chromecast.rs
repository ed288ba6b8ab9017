use async_trait::async_trait;
use parking_lot::Mutex;
use rust_cast::channels::media::{Media, PlayerState, StatusEntry, StreamType};
use rust_cast::channels::receiver::CastDeviceApp;
use rust_cast::CastDevice as RustCastDevice;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{LoadRequest, ReceiverConnector, ReceiverTransport, RunningApp};
use crate::{CastDevice, CasterError, MediaStatus, RemotePlayerState, Result};

const RECEIVER_DESTINATION: &str = "receiver-0";

/// Connects to receivers over the CASTV2 protocol.
#[derive(Debug, Default, Clone)]
pub struct RustCastConnector;

#[async_trait]
impl ReceiverConnector for RustCastConnector {
    async fn connect(&self, device: &CastDevice) -> Result<Arc<dyn ReceiverTransport>> {
        let host = device.address.to_string();
        let port = device.port;
        info!("Connecting to {} at {}:{}", device.name, host, port);

        let cast = tokio::task::spawn_blocking(move || -> Result<RustCastDevice<'static>> {
            let cast = RustCastDevice::connect_without_host_verification(host, port)
                .map_err(|e| CasterError::Network(format!("Failed to connect to receiver: {}", e)))?;
            cast.connection
                .connect(RECEIVER_DESTINATION)
                .map_err(|e| CasterError::Network(format!("Failed to open receiver channel: {}", e)))?;
            cast.heartbeat
                .ping()
                .map_err(|e| CasterError::Network(format!("Receiver did not answer heartbeat: {}", e)))?;
            Ok(cast)
        })
        .await
        .map_err(|e| CasterError::Network(format!("Connect task failed: {}", e)))??;

        Ok(Arc::new(RustCastTransport {
            inner: Arc::new(Mutex::new(Connection {
                cast,
                media_app: None,
                media_session_id: None,
            })),
        }))
    }
}

struct MediaApp {
    transport_id: String,
    session_id: String,
}

struct Connection {
    cast: RustCastDevice<'static>,
    media_app: Option<MediaApp>,
    media_session_id: Option<i32>,
}

impl Connection {
    fn transport_id(&self) -> Result<String> {
        self.media_app
            .as_ref()
            .map(|app| app.transport_id.clone())
            .ok_or_else(|| CasterError::Media("No media loaded on receiver".into()))
    }

    fn refresh(&mut self) -> Result<MediaStatus> {
        let transport_id = self.transport_id()?;
        let status = self
            .cast
            .media
            .get_status(transport_id, None)
            .map_err(|e| CasterError::Network(format!("Failed to get media status: {}", e)))?;
        let media_status = status.entries.first().map(media_status_from).unwrap_or_default();
        self.media_session_id = media_status.media_session_id;
        Ok(media_status)
    }

    /// Media session to command, asking the receiver if none is known yet.
    fn media_session(&mut self) -> Result<(String, i32)> {
        let transport_id = self.transport_id()?;
        if self.media_session_id.is_none() {
            self.refresh()?;
        }
        let id = self
            .media_session_id
            .ok_or_else(|| CasterError::Media("Receiver has no active media session".into()))?;
        Ok((transport_id, id))
    }
}

/// Blocking rust_cast connection driven from `spawn_blocking`.
pub struct RustCastTransport {
    inner: Arc<Mutex<Connection>>,
}

impl RustCastTransport {
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut connection = inner.lock();
            op(&mut connection)
        })
        .await
        .map_err(|e| CasterError::Network(format!("Cast task failed: {}", e)))?
    }
}

#[async_trait]
impl ReceiverTransport for RustCastTransport {
    async fn ping(&self) -> Result<()> {
        self.with_connection(|c| {
            c.cast
                .heartbeat
                .ping()
                .map_err(|e| CasterError::Network(format!("Heartbeat failed: {}", e)))
        })
        .await
    }

    async fn running_app(&self) -> Result<Option<RunningApp>> {
        self.with_connection(|c| {
            let status = c
                .cast
                .receiver
                .get_status()
                .map_err(|e| CasterError::Network(format!("Failed to get receiver status: {}", e)))?;
            Ok(status.applications.first().map(|app| RunningApp {
                app_id: app.app_id.clone(),
                session_id: app.session_id.clone(),
                display_name: app.display_name.clone(),
            }))
        })
        .await
    }

    async fn quit_app(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.with_connection(move |c| {
            c.cast
                .receiver
                .stop_app(session_id)
                .map_err(|e| CasterError::Network(format!("Failed to stop receiver app: {}", e)))?;
            c.media_app = None;
            c.media_session_id = None;
            Ok(())
        })
        .await
    }

    async fn load(&self, request: &LoadRequest) -> Result<MediaStatus> {
        let request = request.clone();
        self.with_connection(move |c| {
            let app = c
                .cast
                .receiver
                .launch_app(&CastDeviceApp::DefaultMediaReceiver)
                .map_err(|e| CasterError::Network(format!("Failed to launch media receiver: {}", e)))?;
            debug!("Media receiver running: {} ({})", app.display_name, app.session_id);

            c.cast
                .connection
                .connect(app.transport_id.clone())
                .map_err(|e| CasterError::Network(format!("Failed to connect to media receiver: {}", e)))?;

            let media = Media {
                content_id: request.url.clone(),
                content_type: request.content_type.clone(),
                stream_type: StreamType::Buffered,
                duration: None,
                metadata: None,
            };

            let status = c
                .cast
                .media
                .load(app.transport_id.clone(), app.session_id.clone(), &media)
                .map_err(|e| CasterError::Network(format!("Failed to load media: {}", e)))?;

            c.media_app = Some(MediaApp {
                transport_id: app.transport_id,
                session_id: app.session_id,
            });
            let media_status = status.entries.first().map(media_status_from).unwrap_or_default();
            c.media_session_id = media_status.media_session_id;
            Ok(media_status)
        })
        .await
    }

    async fn media_status(&self) -> Result<MediaStatus> {
        self.with_connection(|c| c.refresh()).await
    }

    async fn play(&self) -> Result<()> {
        self.with_connection(|c| {
            let (transport_id, id) = c.media_session()?;
            c.cast
                .media
                .play(transport_id, id)
                .map(|_| ())
                .map_err(|e| CasterError::Network(format!("Failed to play: {}", e)))
        })
        .await
    }

    async fn pause(&self) -> Result<()> {
        self.with_connection(|c| {
            let (transport_id, id) = c.media_session()?;
            c.cast
                .media
                .pause(transport_id, id)
                .map(|_| ())
                .map_err(|e| CasterError::Network(format!("Failed to pause: {}", e)))
        })
        .await
    }

    async fn stop(&self) -> Result<()> {
        self.with_connection(|c| {
            let (transport_id, id) = c.media_session()?;
            c.cast
                .media
                .stop(transport_id, id)
                .map(|_| ())
                .map_err(|e| CasterError::Network(format!("Failed to stop: {}", e)))?;
            c.media_session_id = None;
            Ok(())
        })
        .await
    }

    async fn seek(&self, seconds: f64) -> Result<()> {
        self.with_connection(move |c| {
            let (transport_id, id) = c.media_session()?;
            c.cast
                .media
                .seek(transport_id, id, Some(seconds as f32), None)
                .map(|_| ())
                .map_err(|e| CasterError::Network(format!("Failed to seek: {}", e)))
        })
        .await
    }

    async fn set_volume(&self, level: f32) -> Result<()> {
        self.with_connection(move |c| {
            c.cast
                .receiver
                .set_volume(level)
                .map(|_| ())
                .map_err(|e| CasterError::Network(format!("Failed to set volume: {}", e)))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.with_connection(|c| {
            if let Some(app) = c.media_app.take() {
                debug!("Leaving media session {}", app.session_id);
                if let Err(e) = c.cast.connection.disconnect(app.transport_id) {
                    warn!("Failed to leave media session {}: {}", app.session_id, e);
                }
            }
            c.media_session_id = None;
            c.cast
                .connection
                .disconnect(RECEIVER_DESTINATION)
                .map_err(|e| CasterError::Network(format!("Failed to disconnect: {}", e)))
        })
        .await
    }
}

fn media_status_from(entry: &StatusEntry) -> MediaStatus {
    let player_state = match entry.player_state {
        PlayerState::Idle => RemotePlayerState::Idle,
        PlayerState::Playing => RemotePlayerState::Playing,
        PlayerState::Paused => RemotePlayerState::Paused,
        PlayerState::Buffering => RemotePlayerState::Buffering,
    };

    MediaStatus {
        player_state,
        position: entry.current_time.map(f64::from).unwrap_or(0.0),
        duration: entry.media.as_ref().and_then(|m| m.duration).map(f64::from),
        content_id: entry.media.as_ref().map(|m| m.content_id.clone()),
        content_type: entry.media.as_ref().map(|m| m.content_type.clone()),
        media_session_id: Some(entry.media_session_id),
    }
}
