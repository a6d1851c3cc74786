use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

use super::models::{BotStatus, Channel, Group, SessionStatus, Sound, TrackInfo};
use super::playback::PlaybackRegistry;
use super::reconciler::Snapshot;
use super::session::{JoinOutcome, Session};
use super::sounds::SoundLibrary;
use crate::error::BotError;

/// Entry point of the presentation layer: commands and observable state of
/// the bot, composed from the session, the playback registry and the sound
/// library.
pub struct BotService {
    session: Session,
    playback: Arc<PlaybackRegistry>,
    library: Arc<SoundLibrary>,
}

impl BotService {
    pub fn new(session: Session, playback: Arc<PlaybackRegistry>, library: Arc<SoundLibrary>) -> Self {
        Self {
            session,
            playback,
            library,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    // ── Streams ─────────────────────────────────────────────────────

    pub async fn watch_groups(&self) -> Result<BoxStream<'static, Snapshot<Group>>, BotError> {
        self.session.ensure_connected().await?;
        Ok(WatchStream::new(self.session.subscribe_groups()).boxed())
    }

    pub async fn watch_channels(
        &self,
        group_id: &str,
    ) -> Result<BoxStream<'static, Snapshot<Channel>>, BotError> {
        self.session.ensure_connected().await?;
        Ok(WatchStream::new(self.session.subscribe_channels(group_id)).boxed())
    }

    pub fn watch_joined_channel(&self, group_id: &str) -> BoxStream<'static, Option<Channel>> {
        WatchStream::new(self.session.subscribe_joined(group_id)).boxed()
    }

    pub fn watch_now_playing(&self, group_id: &str) -> BoxStream<'static, Option<TrackInfo>> {
        WatchStream::new(self.playback.subscribe_now_playing(group_id)).boxed()
    }

    /// Bot status of a group, re-emitted whenever the joined channel or the
    /// playing track changes.
    pub async fn watch_status(&self, group_id: &str) -> Result<BoxStream<'static, BotStatus>, BotError> {
        self.session.ensure_connected().await?;
        Ok(status_stream(
            self.session.subscribe_joined(group_id),
            self.playback.subscribe_now_playing(group_id),
        ))
    }

    pub fn watch_sounds(&self) -> BoxStream<'static, Snapshot<Sound>> {
        WatchStream::new(self.library.subscribe()).boxed()
    }

    pub fn watch_session(&self) -> BoxStream<'static, SessionStatus> {
        WatchStream::new(self.session.subscribe_status()).boxed()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Join a voice channel, registering the group's player first.
    pub async fn join(&self, group_id: &str, channel_id: &str) -> Result<(), BotError> {
        let provider = self.playback.register_group(group_id);
        let result = match self.session.join(group_id, channel_id, provider).await {
            Ok(JoinOutcome::Joined) | Ok(JoinOutcome::AlreadyJoined) => Ok(()),
            Ok(JoinOutcome::TimedOut) => Err(BotError::AckTimeout("join")),
            Err(e) => Err(e),
        };

        if result.is_err() && self.session.joined_channel(group_id).is_none() {
            self.playback.unregister_group(group_id);
        }
        result
    }

    pub async fn leave(&self, group_id: &str) -> Result<(), BotError> {
        self.session.leave(group_id).await?;
        self.playback.unregister_group(group_id);
        Ok(())
    }

    pub async fn play(&self, group_id: &str, identifier: &str) -> Result<(), BotError> {
        self.session.reset_activity();
        self.playback.play(group_id, identifier).await
    }

    pub async fn shutdown(&self) {
        info!("shutting down bot service");
        self.session.close().await;
    }
}

fn status_stream(
    joined: watch::Receiver<Option<Channel>>,
    playing: watch::Receiver<Option<TrackInfo>>,
) -> BoxStream<'static, BotStatus> {
    stream::unfold(
        (joined, playing, None::<BotStatus>),
        |(mut joined, mut playing, last)| async move {
            loop {
                if last.is_some() {
                    tokio::select! {
                        changed = joined.changed() => changed.ok()?,
                        changed = playing.changed() => changed.ok()?,
                    }
                }
                let status = BotStatus::from_parts(
                    joined.borrow_and_update().clone(),
                    playing.borrow_and_update().clone(),
                );
                if last.as_ref() != Some(&status) {
                    debug!(state = ?status.state, "bot status changed");
                    return Some((status.clone(), (joined, playing, Some(status))));
                }
            }
        },
    )
    .boxed()
}
