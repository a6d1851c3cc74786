//! Audio Engine collaborator: players, track loading and frame production.

pub mod local;

use std::sync::Arc;

use crate::engine::models::TrackInfo;

/// A loaded track ready to be played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub info: TrackInfo,
    /// Encoded frame payload, sliced into frames by the player.
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    TrackStart(TrackInfo),
    TrackEnd(TrackInfo),
}

/// Receives the outcome of [`Player::load`].
pub trait LoadResultHandler: Send + Sync {
    fn track_loaded(&self, track: AudioTrack);
    fn playlist_loaded(&self, tracks: Vec<AudioTrack>);
    fn no_matches(&self);
    fn load_failed(&self, reason: String);
}

pub trait PlayerListener: Send + Sync {
    fn on_event(&self, event: PlayerEvent);
}

/// Pulls audio frames for a voice connection.
pub trait AudioProvider: Send + Sync {
    /// Fill `frame` with the next frame. Returns false when nothing is playing.
    fn provide(&self, frame: &mut Vec<u8>) -> bool;
}

pub trait Player: Send + Sync {
    /// Submit a load. Returns immediately; the outcome goes to `handler`.
    fn load(&self, identifier: &str, handler: Arc<dyn LoadResultHandler>);
    fn play(&self, track: AudioTrack);
    fn stop(&self);
    fn is_playing(&self) -> bool;
    fn provide(&self, frame: &mut Vec<u8>) -> bool;
    fn add_listener(&self, listener: Arc<dyn PlayerListener>);
}

pub trait AudioEngine: Send + Sync {
    fn create_player(&self) -> Arc<dyn Player>;
}
