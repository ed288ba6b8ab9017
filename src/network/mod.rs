pub mod chromecast;
pub mod discovery;
pub mod session;

use async_trait::async_trait;
use std::sync::Arc;

use crate::{CastDevice, MediaStatus, Result};

pub use chromecast::RustCastConnector;
pub use discovery::CastDeviceRegistry;
pub use session::{CastSessionManager, PlaybackPhase, SessionState, Sleeper, TokioSleeper};

/// The cast application currently in the foreground on a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningApp {
    pub app_id: String,
    pub session_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub url: String,
    pub content_type: String,
}

/// Opens connections to receivers.
#[async_trait]
pub trait ReceiverConnector: Send + Sync {
    /// Connects and confirms the link is live before returning.
    async fn connect(&self, device: &CastDevice) -> Result<Arc<dyn ReceiverTransport>>;
}

/// One live connection to a receiver.
///
/// Media commands act on whichever media session the receiver last reported.
#[async_trait]
pub trait ReceiverTransport: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn running_app(&self) -> Result<Option<RunningApp>>;
    async fn quit_app(&self, session_id: &str) -> Result<()>;
    /// Launches the Default Media Receiver if needed and loads with autoplay.
    async fn load(&self, request: &LoadRequest) -> Result<MediaStatus>;
    async fn media_status(&self) -> Result<MediaStatus>;
    async fn play(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn seek(&self, seconds: f64) -> Result<()>;
    async fn set_volume(&self, level: f32) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
