//! The local decode/render pipeline as seen by the orchestrator.
//!
//! Rendering itself lives outside this crate. [`HeadlessPlayer`] keeps the
//! same state without drawing anything, for the CLI and for tests.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{CasterError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Subtitle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackInfo {
    pub id: u32,
    pub kind: TrackKind,
    pub language: Option<String>,
    pub title: Option<String>,
    pub selected: bool,
}

/// Picture adjustments. Local playback only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VideoEffects {
    /// -1.0..=1.0
    pub brightness: f64,
    /// 0.0..=2.0
    pub contrast: f64,
    /// 0.0..=2.0
    pub saturation: f64,
}

impl Default for VideoEffects {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
        }
    }
}

impl VideoEffects {
    pub fn validate(&self) -> Result<()> {
        let in_range = (-1.0..=1.0).contains(&self.brightness)
            && (0.0..=2.0).contains(&self.contrast)
            && (0.0..=2.0).contains(&self.saturation);
        if in_range {
            Ok(())
        } else {
            Err(CasterError::Validation(format!("Video effects out of range: {:?}", self)))
        }
    }
}

/// Local playback pipeline. Calls are synchronous and expected to return quickly.
pub trait LocalPlayerAdapter: Send {
    fn load(&mut self, path: &Path) -> Result<()>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn seek(&mut self, seconds: f64) -> Result<()>;
    fn position(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn set_volume(&mut self, level: f64) -> Result<()>;
    fn volume(&self) -> f64;
    fn tracks(&self, kind: TrackKind) -> Vec<TrackInfo>;
    /// `None` turns the track kind off (subtitles).
    fn select_track(&mut self, kind: TrackKind, id: Option<u32>) -> Result<()>;
    fn set_rate(&mut self, rate: f64) -> Result<()>;
    fn set_video_effects(&mut self, effects: VideoEffects) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Stopped,
    Playing,
    Paused,
}

/// State-only player.
#[derive(Debug)]
pub struct HeadlessPlayer {
    path: Option<PathBuf>,
    state: LocalState,
    position: f64,
    duration: Option<f64>,
    volume: f64,
    rate: f64,
    effects: VideoEffects,
    tracks: Vec<TrackInfo>,
}

impl Default for HeadlessPlayer {
    fn default() -> Self {
        Self {
            path: None,
            state: LocalState::Stopped,
            position: 0.0,
            duration: None,
            volume: 1.0,
            rate: 1.0,
            effects: VideoEffects::default(),
            tracks: Vec::new(),
        }
    }
}

impl HeadlessPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports a known length for whatever gets loaded next.
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_tracks(mut self, tracks: Vec<TrackInfo>) -> Self {
        self.tracks = tracks;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn state(&self) -> LocalState {
        self.state
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn effects(&self) -> VideoEffects {
        self.effects
    }
}

impl LocalPlayerAdapter for HeadlessPlayer {
    fn load(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(CasterError::NotFound(path.display().to_string()));
        }
        debug!("Loading {} locally", path.display());
        self.path = Some(path.to_path_buf());
        self.state = LocalState::Stopped;
        self.position = 0.0;
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        if self.path.is_none() {
            return Err(CasterError::Media("Nothing loaded".into()));
        }
        self.state = LocalState::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.state == LocalState::Playing {
            self.state = LocalState::Paused;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state = LocalState::Stopped;
        self.position = 0.0;
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(CasterError::Validation(format!("Cannot seek to {}", seconds)));
        }
        self.position = match self.duration {
            Some(duration) => seconds.min(duration),
            None => seconds,
        };
        Ok(())
    }

    fn position(&self) -> f64 {
        self.position
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn set_volume(&mut self, level: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&level) {
            return Err(CasterError::Validation(format!("Volume {} is outside 0.0..=1.0", level)));
        }
        self.volume = level;
        Ok(())
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn tracks(&self, kind: TrackKind) -> Vec<TrackInfo> {
        self.tracks.iter().filter(|t| t.kind == kind).cloned().collect()
    }

    fn select_track(&mut self, kind: TrackKind, id: Option<u32>) -> Result<()> {
        if let Some(id) = id {
            if !self.tracks.iter().any(|t| t.kind == kind && t.id == id) {
                return Err(CasterError::NotFound(format!("{:?} track {}", kind, id)));
            }
        }
        for track in self.tracks.iter_mut().filter(|t| t.kind == kind) {
            track.selected = Some(track.id) == id;
        }
        Ok(())
    }

    fn set_rate(&mut self, rate: f64) -> Result<()> {
        self.rate = rate;
        Ok(())
    }

    fn set_video_effects(&mut self, effects: VideoEffects) -> Result<()> {
        self.effects = effects;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks() -> Vec<TrackInfo> {
        vec![
            TrackInfo { id: 1, kind: TrackKind::Audio, language: Some("en".into()), title: None, selected: true },
            TrackInfo { id: 2, kind: TrackKind::Audio, language: Some("de".into()), title: None, selected: false },
            TrackInfo { id: 3, kind: TrackKind::Subtitle, language: Some("en".into()), title: None, selected: false },
        ]
    }

    #[test]
    fn test_track_selection() {
        let mut player = HeadlessPlayer::new().with_tracks(tracks());
        player.select_track(TrackKind::Audio, Some(2)).unwrap();
        let audio = player.tracks(TrackKind::Audio);
        assert!(!audio[0].selected);
        assert!(audio[1].selected);

        player.select_track(TrackKind::Subtitle, Some(3)).unwrap();
        player.select_track(TrackKind::Subtitle, None).unwrap();
        assert!(!player.tracks(TrackKind::Subtitle)[0].selected);

        assert!(player.select_track(TrackKind::Subtitle, Some(1)).is_err());
    }

    #[test]
    fn test_seek_is_bounded_by_duration() {
        let mut player = HeadlessPlayer::new().with_duration(100.0);
        player.seek(250.0).unwrap();
        assert_eq!(player.position(), 100.0);
        assert!(player.seek(f64::NAN).is_err());
    }

    #[test]
    fn test_video_effects_validation() {
        assert!(VideoEffects::default().validate().is_ok());
        let bad = VideoEffects { contrast: 3.0, ..VideoEffects::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_play_requires_load() {
        let mut player = HeadlessPlayer::new();
        assert!(player.play().is_err());
        assert!(player.load(Path::new("/definitely/not/here.mp4")).is_err());
    }
}
