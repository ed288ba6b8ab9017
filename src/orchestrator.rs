//! Routes every user action to the local pipeline or the cast session,
//! depending on the current mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::converter::{PlayableSource, ProgressSink};
use crate::network::CastSessionManager;
use crate::player::{LocalPlayerAdapter, TrackInfo, TrackKind, VideoEffects};
use crate::playlist::{Playlist, PlaylistEntry, RepeatMode};
use crate::server::RangeFileServer;
use crate::{CasterError, PlayMode, Result};

const MIN_RATE: f64 = 0.25;
const MAX_RATE: f64 = 4.0;

/// Keeps the machine awake while a receiver is streaming from us.
pub trait StandbyInhibitor: Send + Sync {
    fn inhibit(&self, reason: &str) -> Result<()>;
    fn release(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInhibitor;

impl StandbyInhibitor for NoopInhibitor {
    fn inhibit(&self, reason: &str) -> Result<()> {
        debug!("Standby inhibit requested: {}", reason);
        Ok(())
    }

    fn release(&self) {}
}

/// What the receiver was given when cast playback started.
#[derive(Debug)]
pub struct CastStart {
    pub url: String,
    pub served_path: PathBuf,
    /// Set when conversion failed and the original file was sent instead.
    pub conversion_error: Option<CasterError>,
}

#[derive(Debug)]
pub enum PlayOutcome {
    Local,
    Resumed,
    CastStarted(CastStart),
}

pub struct PlaybackOrchestrator {
    mode: PlayMode,
    player: Box<dyn LocalPlayerAdapter>,
    converter: Arc<dyn PlayableSource>,
    server: Arc<RangeFileServer>,
    session: Arc<CastSessionManager>,
    inhibitor: Box<dyn StandbyInhibitor>,
    inhibited: bool,
    current: Option<PathBuf>,
    cast_path: Option<PathBuf>,
    rate: f64,
    ab_loop: Option<(f64, f64)>,
    effects: VideoEffects,
    playlist: Playlist,
    repeat: RepeatMode,
    pending_cast_seek: Option<f64>,
    progress: Option<ProgressSink>,
}

impl PlaybackOrchestrator {
    pub fn new(
        player: Box<dyn LocalPlayerAdapter>,
        converter: Arc<dyn PlayableSource>,
        server: Arc<RangeFileServer>,
        session: Arc<CastSessionManager>,
    ) -> Self {
        Self {
            mode: PlayMode::Local,
            player,
            converter,
            server,
            session,
            inhibitor: Box::new(NoopInhibitor),
            inhibited: false,
            current: None,
            cast_path: None,
            rate: 1.0,
            ab_loop: None,
            effects: VideoEffects::default(),
            playlist: Playlist::new(),
            repeat: RepeatMode::Off,
            pending_cast_seek: None,
            progress: None,
        }
    }

    pub fn with_inhibitor(mut self, inhibitor: Box<dyn StandbyInhibitor>) -> Self {
        self.inhibitor = inhibitor;
        self
    }

    pub fn set_progress_sink(&mut self, sink: Option<ProgressSink>) {
        self.progress = sink;
    }

    pub fn mode(&self) -> PlayMode {
        self.mode
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// The file the receiver is streaming, which may be a converted copy.
    pub fn cast_path(&self) -> Option<&Path> {
        self.cast_path.as_deref()
    }

    pub fn session(&self) -> &Arc<CastSessionManager> {
        &self.session
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn playlist_mut(&mut self) -> &mut Playlist {
        &mut self.playlist
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: RepeatMode) {
        self.repeat = repeat;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn ab_loop(&self) -> Option<(f64, f64)> {
        self.ab_loop
    }

    pub fn video_effects(&self) -> VideoEffects {
        self.effects
    }

    pub fn is_standby_inhibited(&self) -> bool {
        self.inhibited
    }

    fn inhibit_standby(&mut self) {
        if self.inhibited {
            return;
        }
        match self.inhibitor.inhibit("Streaming to cast device") {
            Ok(()) => self.inhibited = true,
            Err(e) => warn!("Failed to inhibit standby: {}", e),
        }
    }

    fn release_standby(&mut self) {
        if self.inhibited {
            self.inhibitor.release();
            self.inhibited = false;
        }
    }

    /// Carries rate and picture settings over to whatever the local player loaded.
    fn apply_local_settings(&mut self) -> Result<()> {
        if self.rate != 1.0 {
            self.player.set_rate(self.rate)?;
        }
        if self.effects != VideoEffects::default() {
            self.player.set_video_effects(self.effects)?;
        }
        Ok(())
    }

    /// Makes `path` the current file. Nothing is sent to a receiver until `play`.
    pub async fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        info!("Loading {}", path.display());

        match self.mode {
            PlayMode::Local => {
                self.player.load(&path)?;
                self.apply_local_settings()?;
            }
            PlayMode::Cast => {
                if self.session.has_live_media() {
                    self.session.stop().await?;
                }
                self.release_standby();
            }
        }

        self.playlist.add(PlaylistEntry::new(&path));
        self.playlist.select(&path);
        self.current = Some(path);
        self.cast_path = None;
        self.ab_loop = None;
        self.pending_cast_seek = None;
        Ok(())
    }

    pub async fn play(&mut self) -> Result<PlayOutcome> {
        match self.mode {
            PlayMode::Local => {
                self.player.play()?;
                Ok(PlayOutcome::Local)
            }
            PlayMode::Cast if self.session.has_live_media() => {
                self.session.resume().await?;
                self.inhibit_standby();
                Ok(PlayOutcome::Resumed)
            }
            PlayMode::Cast => {
                self.inhibit_standby();
                match self.start_cast().await {
                    Ok(start) => Ok(PlayOutcome::CastStarted(start)),
                    Err(e) => {
                        self.release_standby();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Convert if needed, serve, load on the receiver, then restore any
    /// position carried over from local playback.
    async fn start_cast(&mut self) -> Result<CastStart> {
        let source = self
            .current
            .clone()
            .ok_or_else(|| CasterError::Validation("No file loaded".into()))?;
        if !self.session.is_connected() {
            return Err(CasterError::NotConnected);
        }

        let (served_path, conversion_error) = match self.converter.ensure_playable(&source, self.progress.clone()).await {
            Ok(path) => (path, None),
            Err(e) => {
                warn!("Conversion of {} failed, sending original: {}", source.display(), e);
                (source.clone(), Some(e))
            }
        };

        let url = self.server.get_url(&served_path).await?;
        info!("Streaming {} from {}", served_path.display(), url);
        self.session.play_video(&served_path, &url).await?;
        self.cast_path = Some(served_path.clone());

        if let Some(position) = self.pending_cast_seek.take() {
            if let Err(e) = self.session.seek(position).await {
                warn!("Could not restore position {:.1}s on receiver: {}", position, e);
            }
        }

        Ok(CastStart {
            url,
            served_path,
            conversion_error,
        })
    }

    pub async fn pause(&mut self) -> Result<()> {
        match self.mode {
            PlayMode::Local => self.player.pause(),
            PlayMode::Cast => {
                self.release_standby();
                self.session.pause().await
            }
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        match self.mode {
            PlayMode::Local => self.player.stop(),
            PlayMode::Cast => {
                self.release_standby();
                self.session.stop().await
            }
        }
    }

    pub async fn seek(&mut self, seconds: f64) -> Result<()> {
        match self.mode {
            PlayMode::Local => self.player.seek(seconds),
            PlayMode::Cast => self.session.seek(seconds).await,
        }
    }

    pub async fn set_volume(&mut self, level: f64) -> Result<()> {
        match self.mode {
            PlayMode::Local => self.player.set_volume(level),
            PlayMode::Cast => self.session.set_volume(level).await,
        }
    }

    /// Current position. In cast mode this refreshes remote status first,
    /// subject to the session's rate limit.
    pub async fn position(&self) -> f64 {
        match self.mode {
            PlayMode::Local => self.player.position(),
            PlayMode::Cast => {
                if let Err(e) = self.session.refresh_status().await {
                    debug!("Status refresh failed: {}", e);
                }
                self.session.position()
            }
        }
    }

    pub async fn duration(&self) -> Option<f64> {
        match self.mode {
            PlayMode::Local => self.player.duration(),
            PlayMode::Cast => {
                if let Err(e) = self.session.refresh_status().await {
                    debug!("Status refresh failed: {}", e);
                }
                self.session.duration()
            }
        }
    }

    /// Stops the outgoing side, then readies the incoming one at the same position.
    ///
    /// Going back to local always reloads the original file, never the
    /// converted copy the receiver was streaming.
    pub async fn switch_mode(&mut self, mode: PlayMode) -> Result<()> {
        if mode == self.mode {
            return Ok(());
        }
        info!("Switching playback mode {:?} -> {:?}", self.mode, mode);

        let carried = match self.mode {
            PlayMode::Local => {
                let position = self.player.position();
                self.player.stop()?;
                position
            }
            PlayMode::Cast => {
                if let Err(e) = self.session.refresh_status().await {
                    debug!("Status refresh failed: {}", e);
                }
                let position = self.session.position();
                if let Err(e) = self.session.stop().await {
                    warn!("Failed to stop cast playback: {}", e);
                }
                self.release_standby();
                position
            }
        };

        self.mode = mode;
        self.cast_path = None;

        match mode {
            PlayMode::Local => {
                if let Some(path) = self.current.clone() {
                    self.player.load(&path)?;
                    self.apply_local_settings()?;
                    if carried > 0.0 {
                        self.player.seek(carried)?;
                    }
                }
            }
            PlayMode::Cast => {
                self.pending_cast_seek = (carried > 0.0).then_some(carried);
            }
        }
        Ok(())
    }

    /// Local end-of-stream. Returns whether something new started playing.
    pub async fn on_end_of_stream(&mut self) -> Result<bool> {
        if self.mode != PlayMode::Local {
            return Ok(false);
        }

        if self.repeat == RepeatMode::One {
            self.player.seek(0.0)?;
            self.player.play()?;
            return Ok(true);
        }

        let next = self
            .playlist
            .next(self.repeat == RepeatMode::All)
            .map(|entry| entry.path.clone());
        match next {
            Some(path) => {
                self.load(&path).await?;
                self.player.play()?;
                Ok(true)
            }
            None => {
                self.player.stop()?;
                Ok(false)
            }
        }
    }

    /// Called by the UI on each timeline tick. Jumps back to A once B is reached.
    pub fn on_position_tick(&mut self) -> Result<bool> {
        let Some((a, b)) = self.ab_loop else {
            return Ok(false);
        };
        if self.mode != PlayMode::Local || self.player.position() < b {
            return Ok(false);
        }
        self.player.seek(a)?;
        Ok(true)
    }

    pub fn set_ab_loop(&mut self, bounds: Option<(f64, f64)>) -> Result<()> {
        if let Some((a, b)) = bounds {
            if !a.is_finite() || !b.is_finite() || a < 0.0 || b <= a {
                return Err(CasterError::Validation(format!("Invalid A-B loop {:.1}..{:.1}", a, b)));
            }
        }
        self.ab_loop = bounds;
        Ok(())
    }

    /// Local playback speed. Kept while casting and applied on return.
    pub fn set_rate(&mut self, rate: f64) -> Result<()> {
        if !(MIN_RATE..=MAX_RATE).contains(&rate) {
            return Err(CasterError::Validation(format!(
                "Playback rate {} is outside {}..={}",
                rate, MIN_RATE, MAX_RATE
            )));
        }
        self.rate = rate;
        if self.mode == PlayMode::Local {
            self.player.set_rate(rate)?;
        }
        Ok(())
    }

    pub fn set_video_effects(&mut self, effects: VideoEffects) -> Result<()> {
        effects.validate()?;
        self.effects = effects;
        if self.mode == PlayMode::Local {
            self.player.set_video_effects(effects)?;
        }
        Ok(())
    }

    pub fn tracks(&self, kind: TrackKind) -> Vec<TrackInfo> {
        match self.mode {
            PlayMode::Local => self.player.tracks(kind),
            PlayMode::Cast => Vec::new(),
        }
    }

    pub fn select_track(&mut self, kind: TrackKind, id: Option<u32>) -> Result<()> {
        match self.mode {
            PlayMode::Local => self.player.select_track(kind, id),
            PlayMode::Cast => Err(CasterError::Validation(
                "Track selection is not available while casting".into(),
            )),
        }
    }

    pub async fn next(&mut self) -> Result<Option<PlayOutcome>> {
        let Some(path) = self
            .playlist
            .next(self.repeat == RepeatMode::All)
            .map(|e| e.path.clone())
        else {
            return Ok(None);
        };
        self.load(&path).await?;
        self.play().await.map(Some)
    }

    pub async fn previous(&mut self) -> Result<Option<PlayOutcome>> {
        let Some(path) = self.playlist.previous().map(|e| e.path.clone()) else {
            return Ok(None);
        };
        self.load(&path).await?;
        self.play().await.map(Some)
    }

    /// Releases standby, stops both sides, drops the receiver and the server.
    pub async fn shutdown(&mut self) {
        info!("Shutting down playback");
        self.release_standby();

        if let Err(e) = self.player.stop() {
            warn!("Failed to stop local player: {}", e);
        }

        if self.session.is_connected() {
            if let Err(e) = self.session.stop().await {
                warn!("Failed to stop cast playback: {}", e);
            }
        }
        if let Err(e) = self.session.disconnect().await {
            warn!("Failed to disconnect: {}", e);
        }

        self.server.stop().await;
    }
}
