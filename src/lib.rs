pub mod cache;
pub mod config;
pub mod converter;
pub mod error;
pub mod media;
pub mod network;
pub mod orchestrator;
pub mod player;
pub mod playlist;
pub mod server;

pub use error::{Result, CasterError};

use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// App id of the Default Media Receiver.
pub const DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";

/// A cast receiver seen on the local network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CastDevice {
    pub id: Uuid,
    pub name: String,
    pub model_name: String,
    pub address: IpAddr,
    pub port: u16,
    /// Cast application currently running on the device, if announced.
    pub app_id: Option<String>,
    pub is_group: bool,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl CastDevice {
    pub fn new(id: Uuid, name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            model_name: String::new(),
            address,
            port,
            app_id: None,
            is_group: false,
            discovered_at: now,
            last_seen: now,
        }
    }

    /// True when every visible field matches. Timestamps are ignored.
    pub fn same_announcement(&self, other: &CastDevice) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.model_name == other.model_name
            && self.address == other.address
            && self.port == other.port
            && self.app_id == other.app_id
            && self.is_group == other.is_group
    }
}

/// Player state as reported by the receiver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemotePlayerState {
    #[default]
    Idle,
    Playing,
    Paused,
    Buffering,
}

impl RemotePlayerState {
    pub fn is_started(self) -> bool {
        matches!(self, RemotePlayerState::Playing | RemotePlayerState::Buffering)
    }
}

/// Last known remote media status. Only as fresh as the last explicit refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaStatus {
    pub player_state: RemotePlayerState,
    pub position: f64,
    pub duration: Option<f64>,
    pub content_id: Option<String>,
    pub content_type: Option<String>,
    /// Present while the receiver has content loaded.
    pub media_session_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayMode {
    #[default]
    Local,
    Cast,
}

/// MIME type sent to the receiver for a file.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        _ => "video/mp4",
    }
}

/// Containers receivers cannot play directly.
pub fn needs_conversion(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref(),
        Some("mkv") | Some("avi")
    )
}

/// Formats seconds as `MM:SS`, or `HH:MM:SS` past the hour.
pub fn format_time(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 { seconds as u64 } else { 0 };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type_for(&PathBuf::from("a.MP4")), "video/mp4");
        assert_eq!(mime_type_for(&PathBuf::from("a.m4v")), "video/mp4");
        assert_eq!(mime_type_for(&PathBuf::from("a.mkv")), "video/x-matroska");
        assert_eq!(mime_type_for(&PathBuf::from("a.avi")), "video/x-msvideo");
        assert_eq!(mime_type_for(&PathBuf::from("a.webm")), "video/webm");
        assert_eq!(mime_type_for(&PathBuf::from("a.mov")), "video/mp4");
        assert_eq!(mime_type_for(&PathBuf::from("noext")), "video/mp4");
    }

    #[test]
    fn test_needs_conversion() {
        assert!(needs_conversion(&PathBuf::from("/v/movie.mkv")));
        assert!(needs_conversion(&PathBuf::from("/v/movie.AVI")));
        assert!(!needs_conversion(&PathBuf::from("/v/movie.mp4")));
        assert!(!needs_conversion(&PathBuf::from("/v/movie.webm")));
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "00:00");
        assert_eq!(format_time(-5.0), "00:00");
        assert_eq!(format_time(75.9), "01:15");
        assert_eq!(format_time(3725.0), "01:02:05");
    }

    #[test]
    fn test_started_states() {
        assert!(RemotePlayerState::Playing.is_started());
        assert!(RemotePlayerState::Buffering.is_started());
        assert!(!RemotePlayerState::Idle.is_started());
        assert!(!RemotePlayerState::Paused.is_started());
    }
}
