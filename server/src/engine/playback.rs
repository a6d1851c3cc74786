use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::models::{GroupId, TrackInfo};
use super::sounds::SoundLibrary;
use crate::audio::{
    AudioEngine, AudioProvider, AudioTrack, LoadResultHandler, Player, PlayerEvent,
    PlayerListener,
};
use crate::error::BotError;

/// Per-group players and their "currently playing" state.
pub struct PlaybackRegistry {
    engine: Arc<dyn AudioEngine>,
    library: Arc<SoundLibrary>,
    providers: DashMap<GroupId, Arc<GroupAudio>>,
    /// Kept while a player's listener or a subscriber holds it, so
    /// subscribers survive unregister/register cycles.
    now_playing: DashMap<GroupId, Arc<watch::Sender<Option<TrackInfo>>>>,
}

/// Audio source of one group: a player the voice connection pulls frames from.
pub struct GroupAudio {
    player: Arc<dyn Player>,
}

impl AudioProvider for GroupAudio {
    fn provide(&self, frame: &mut Vec<u8>) -> bool {
        self.player.provide(frame)
    }
}

/// Mirrors track start/end into a group's now-playing value.
struct NowPlaying {
    group_id: GroupId,
    tx: Arc<watch::Sender<Option<TrackInfo>>>,
}

impl PlayerListener for NowPlaying {
    fn on_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::TrackStart(track) => {
                info!(group_id = %self.group_id, title = %track.title, "track started");
                self.tx.send_replace(Some(track));
            }
            PlayerEvent::TrackEnd(track) => {
                info!(group_id = %self.group_id, title = %track.title, "track ended");
                self.tx
                    .send_if_modified(|current| current.take().is_some());
            }
        }
    }
}

/// Starts playback once a load succeeds.
struct TrackScheduler {
    group_id: GroupId,
    identifier: String,
    player: Arc<dyn Player>,
}

impl LoadResultHandler for TrackScheduler {
    fn track_loaded(&self, track: AudioTrack) {
        self.player.play(track);
    }

    fn playlist_loaded(&self, tracks: Vec<AudioTrack>) {
        info!(
            group_id = %self.group_id,
            identifier = %self.identifier,
            count = tracks.len(),
            "playlists are not played"
        );
    }

    fn no_matches(&self) {
        warn!(group_id = %self.group_id, identifier = %self.identifier, "no track found");
    }

    fn load_failed(&self, reason: String) {
        error!(group_id = %self.group_id, identifier = %self.identifier, %reason, "track load failed");
    }
}

impl PlaybackRegistry {
    pub fn new(engine: Arc<dyn AudioEngine>, library: Arc<SoundLibrary>) -> Self {
        Self {
            engine,
            library,
            providers: DashMap::new(),
            now_playing: DashMap::new(),
        }
    }

    /// Create the group's player, or return the existing one.
    pub fn register_group(&self, group_id: &str) -> Arc<dyn AudioProvider> {
        self.providers
            .entry(group_id.to_string())
            .or_insert_with(|| {
                let player = self.engine.create_player();
                player.add_listener(Arc::new(NowPlaying {
                    group_id: group_id.to_string(),
                    tx: self.now_playing_sender(group_id),
                }));
                Arc::new(GroupAudio { player })
            })
            .clone()
    }

    /// Stop and discard the group's player.
    pub fn unregister_group(&self, group_id: &str) {
        if let Some((_, audio)) = self.providers.remove(group_id) {
            audio.player.stop();
        }
        if let Some(tx) = self.now_playing.get(group_id) {
            tx.send_if_modified(|current| current.take().is_some());
        }
        self.prune_now_playing();
    }

    pub fn is_registered(&self, group_id: &str) -> bool {
        self.providers.contains_key(group_id)
    }

    /// Load and play a track in a group. Loading is asynchronous; this returns
    /// once the load has been submitted.
    pub async fn play(&self, group_id: &str, identifier: &str) -> Result<(), BotError> {
        let resolved = self.library.resolve_identifier(identifier).await?;
        let player = self
            .providers
            .get(group_id)
            .map(|audio| audio.player.clone())
            .ok_or_else(|| BotError::not_found(format!("no player registered for group {group_id}")))?;

        if player.is_playing() {
            player.stop();
        }
        info!(%group_id, %identifier, "loading track");
        player.load(
            &resolved,
            Arc::new(TrackScheduler {
                group_id: group_id.to_string(),
                identifier: identifier.to_string(),
                player: player.clone(),
            }),
        );
        Ok(())
    }

    pub fn subscribe_now_playing(&self, group_id: &str) -> watch::Receiver<Option<TrackInfo>> {
        self.prune_now_playing();
        self.now_playing_sender(group_id).subscribe()
    }

    pub fn now_playing(&self, group_id: &str) -> Option<TrackInfo> {
        self.now_playing
            .get(group_id)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Drop senders held only by this map: no live player listens for the
    /// group and nobody subscribed.
    fn prune_now_playing(&self) {
        self.now_playing
            .retain(|_, tx| Arc::strong_count(tx) > 1 || tx.receiver_count() > 0);
    }

    fn now_playing_sender(&self, group_id: &str) -> Arc<watch::Sender<Option<TrackInfo>>> {
        self.now_playing
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(watch::channel(None).0))
            .clone()
    }
}
