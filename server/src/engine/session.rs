use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::debounce::{ActivityMonitor, launch_inactive_timeout};
use super::group_watcher::GroupWatcher;
use super::models::{Channel, ChannelId, ConnectionState, Group, GroupId, SessionStatus};
use super::reconciler::Snapshot;
use crate::audio::AudioProvider;
use crate::config::SessionSection;
use crate::error::BotError;
use crate::gateway::{GatewayClient, GatewayConnection, SelfEvent, VoiceConnection};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which the session logs out.
    pub inactivity_timeout: Duration,
    /// Bound on join, leave and logout acknowledgements.
    pub ack_timeout: Duration,
    /// Log out and back in before joining a channel in a group whose previous
    /// voice connection was just torn down.
    pub reconnect_before_rejoin: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(600),
            ack_timeout: Duration::from_secs(5),
            reconnect_before_rejoin: false,
        }
    }
}

impl From<&SessionSection> for SessionConfig {
    fn from(section: &SessionSection) -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(section.inactivity_timeout_secs),
            ack_timeout: Duration::from_secs(section.ack_timeout_secs),
            reconnect_before_rejoin: section.reconnect_before_rejoin,
        }
    }
}

/// How a successful `join` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Already joined to the requested channel; nothing changed.
    AlreadyJoined,
    /// The join was not acknowledged in time. No voice state was recorded.
    TimedOut,
}

struct VoiceSlot {
    channel: Channel,
    connection: Arc<dyn VoiceConnection>,
}

#[derive(Default)]
struct Lifecycle {
    connection: Option<Arc<dyn GatewayConnection>>,
    /// Root token of the live connection. Every background task of the
    /// connection runs under a child of it.
    cancel: Option<CancellationToken>,
}

struct SessionInner {
    gateway: Arc<dyn GatewayClient>,
    config: SessionConfig,
    /// Serializes login, logout and teardown.
    lifecycle: Mutex<Lifecycle>,
    /// Bumped on every connect and teardown. Background tasks carry the value
    /// they were spawned with and go quiet once it moves on.
    generation: AtomicU64,
    status: watch::Sender<SessionStatus>,
    activity: parking_lot::Mutex<Option<ActivityMonitor>>,
    groups: Arc<GroupWatcher>,
    voice: DashMap<GroupId, VoiceSlot>,
    /// Per-group joined channel, set and cleared together with `voice`.
    /// Entries live while they hold a channel or have subscribers, so
    /// subscribers survive reconnects.
    joined: DashMap<GroupId, watch::Sender<Option<Channel>>>,
    group_locks: DashMap<GroupId, Arc<Mutex<()>>>,
}

/// Held for the duration of a join, leave or voice drop on one group.
struct GroupGuard<'a> {
    locks: &'a DashMap<GroupId, Arc<Mutex<()>>>,
    group_id: GroupId,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        // The map and this guard are the only holders: nobody is waiting.
        self.locks
            .remove_if(&self.group_id, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// Supervisor of the single gateway connection and the per-group voice
/// connections built on it.
///
/// At most one connection is live at a time. It is created lazily by
/// [`Session::ensure_connected`] and torn down on explicit close, on
/// inactivity, or when the remote side drops it. Joins and leaves on
/// different groups run concurrently; the same group is serialized.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(gateway: Arc<dyn GatewayClient>, config: SessionConfig) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: ConnectionState::Disconnected,
            connected_at: None,
        });

        Self {
            inner: Arc::new(SessionInner {
                gateway,
                config,
                lifecycle: Mutex::new(Lifecycle::default()),
                generation: AtomicU64::new(0),
                status,
                activity: parking_lot::Mutex::new(None),
                groups: Arc::new(GroupWatcher::new()),
                voice: DashMap::new(),
                joined: DashMap::new(),
                group_locks: DashMap::new(),
            }),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Return the live connection, logging in first if there is none.
    ///
    /// Concurrent callers share one login. A failed login leaves the session
    /// disconnected; the next call tries again.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn GatewayConnection>, BotError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(conn) = &lifecycle.connection {
            return Ok(conn.clone());
        }
        self.connect(&mut lifecycle).await
    }

    /// Log out (bounded by the ack timeout) and tear everything down.
    pub async fn close(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.logout_and_teardown(&mut lifecycle).await;
    }

    async fn connect(
        &self,
        lifecycle: &mut Lifecycle,
    ) -> Result<Arc<dyn GatewayConnection>, BotError> {
        self.set_status(ConnectionState::Connecting);
        info!("logging in to gateway");

        let conn = match self.inner.gateway.login().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "gateway login failed");
                self.set_status(ConnectionState::Disconnected);
                return Err(BotError::Connection(e.to_string()));
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        lifecycle.connection = Some(conn.clone());
        lifecycle.cancel = Some(cancel.clone());

        self.spawn_disconnect_watch(conn.clone(), cancel.child_token(), generation);
        self.spawn_self_event_watch(conn.clone(), cancel.child_token(), generation);

        let weak = Arc::downgrade(&self.inner);
        let monitor = launch_inactive_timeout(
            self.inner.config.inactivity_timeout,
            cancel.child_token(),
            move || async move {
                if let Some(session) = Session::upgrade(&weak) {
                    info!("session idle, closing");
                    session.close_generation(generation).await;
                }
            },
        );
        *self.inner.activity.lock() = Some(monitor);

        self.inner.groups.start(conn.clone(), &cancel);

        self.inner.status.send_replace(SessionStatus {
            state: ConnectionState::Connected,
            connected_at: Some(Utc::now()),
        });
        info!(generation, "gateway connected");
        Ok(conn)
    }

    async fn close_generation(&self, generation: u64) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.generation() == generation {
            self.logout_and_teardown(&mut lifecycle).await;
        }
    }

    async fn reconnect(&self) -> Result<Arc<dyn GatewayConnection>, BotError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        info!("reconnecting before rejoin");
        self.logout_and_teardown(&mut lifecycle).await;
        self.connect(&mut lifecycle).await
    }

    async fn logout_and_teardown(&self, lifecycle: &mut Lifecycle) {
        if let Some(conn) = lifecycle.connection.clone() {
            match timeout(self.inner.config.ack_timeout, conn.logout()).await {
                Ok(Ok(())) => info!("logged out of gateway"),
                Ok(Err(e)) => warn!(error = %e, "gateway logout failed"),
                Err(_) => warn!(
                    timeout = ?self.inner.config.ack_timeout,
                    "gateway logout was not acknowledged in time"
                ),
            }
        }
        self.teardown(lifecycle);
    }

    /// The single teardown path: cancel every background task, drop all voice
    /// state and empty the mirrors.
    fn teardown(&self, lifecycle: &mut Lifecycle) {
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        let had_connection = lifecycle.connection.take().is_some();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.activity.lock().take();

        self.inner.groups.reset();
        self.inner.voice.clear();
        for joined in self.inner.joined.iter() {
            joined.send_if_modified(|channel| channel.take().is_some());
        }
        self.prune_joined();

        self.inner.status.send_replace(SessionStatus {
            state: ConnectionState::Disconnected,
            connected_at: None,
        });
        if had_connection {
            info!("session torn down");
        }
    }

    fn spawn_disconnect_watch(
        &self,
        conn: Arc<dyn GatewayConnection>,
        token: CancellationToken,
        generation: u64,
    ) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = conn.disconnected() => {}
            }
            let Some(session) = Session::upgrade(&weak) else {
                return;
            };
            let mut lifecycle = session.inner.lifecycle.lock().await;
            if session.generation() == generation {
                warn!("gateway connection dropped by remote side");
                session.teardown(&mut lifecycle);
            }
        });
    }

    fn spawn_self_event_watch(
        &self,
        conn: Arc<dyn GatewayConnection>,
        token: CancellationToken,
        generation: u64,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let mut events = conn.self_events();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => return,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                let Some(session) = Session::upgrade(&weak) else {
                    return;
                };
                match event {
                    SelfEvent::LeftGroup { group_id } => {
                        info!(%group_id, "removed from group");
                        session.drop_voice(&group_id, None, generation).await;
                    }
                    SelfEvent::VoiceDisconnected {
                        group_id,
                        channel_id,
                    } => {
                        session
                            .drop_voice(&group_id, Some(&channel_id), generation)
                            .await;
                    }
                }
            }
        });
    }

    /// Clear a group's voice state after the remote side dropped it. With a
    /// channel id, only a slot bound to that channel whose connection is no
    /// longer connected is cleared: a late event for a connection we already
    /// replaced must not touch the new one.
    async fn drop_voice(&self, group_id: &str, channel_id: Option<&str>, generation: u64) {
        let _guard = self.lock_group(group_id).await;
        if self.generation() != generation {
            return;
        }

        let removed = self.inner.voice.remove_if(group_id, |_, slot| match channel_id {
            None => true,
            Some(id) => slot.channel.id == id && !slot.connection.is_connected(),
        });
        let Some((_, slot)) = removed else {
            return;
        };
        self.set_joined(group_id, None);
        info!(%group_id, channel_id = %slot.channel.id, "voice connection dropped");
        self.disconnect_voice(group_id, &slot).await;
    }

    // ── Voice ───────────────────────────────────────────────────────

    /// Join a voice channel of a group, moving out of any channel the bot is
    /// currently in there.
    ///
    /// The target is validated before any voice state changes. A join that is
    /// not acknowledged within the ack timeout records nothing and reports
    /// [`JoinOutcome::TimedOut`].
    pub async fn join(
        &self,
        group_id: &str,
        channel_id: &str,
        provider: Arc<dyn AudioProvider>,
    ) -> Result<JoinOutcome, BotError> {
        self.reset_activity();
        let _guard = self.lock_group(group_id).await;

        if self.joined_channel_id(group_id).as_deref() == Some(channel_id) {
            debug!(%group_id, %channel_id, "already joined");
            return Ok(JoinOutcome::AlreadyJoined);
        }

        let mut conn = self.ensure_connected().await?;
        let channel = conn.resolve_channel(group_id, channel_id).await?;
        if !channel.is_voice() {
            return Err(BotError::validation(format!(
                "channel {channel_id} is not a voice channel"
            )));
        }

        let left = self.force_leave(group_id).await;
        if left && self.inner.config.reconnect_before_rejoin {
            conn = self.reconnect().await?;
        }

        let generation = self.generation();
        let voice = match timeout(
            self.inner.config.ack_timeout,
            conn.join_voice(group_id, channel_id, provider),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(%group_id, %channel_id, "voice join was not acknowledged in time");
                return Ok(JoinOutcome::TimedOut);
            }
        };

        // Record under the lifecycle lock so a concurrent teardown cannot
        // slip in between the generation check and the insert.
        let recorded = {
            let _lifecycle = self.inner.lifecycle.lock().await;
            if self.generation() == generation {
                self.inner.voice.insert(
                    group_id.to_string(),
                    VoiceSlot {
                        channel: channel.clone(),
                        connection: voice.clone(),
                    },
                );
                self.set_joined(group_id, Some(channel.clone()));
                true
            } else {
                false
            }
        };
        if !recorded {
            warn!(%group_id, %channel_id, "session closed while joining");
            let slot = VoiceSlot { channel, connection: voice };
            self.disconnect_voice(group_id, &slot).await;
            return Err(BotError::Connection("session closed while joining".into()));
        }

        self.reset_activity();
        info!(%group_id, %channel_id, "joined voice channel");
        Ok(JoinOutcome::Joined)
    }

    /// Leave the voice channel of a group. The voice state is cleared even if
    /// the disconnect is never acknowledged.
    pub async fn leave(&self, group_id: &str) -> Result<(), BotError> {
        self.reset_activity();
        if !self.inner.voice.contains_key(group_id) {
            return Err(BotError::not_found(format!(
                "no voice connection in group {group_id}"
            )));
        }
        let _guard = self.lock_group(group_id).await;

        let Some((_, slot)) = self.inner.voice.remove(group_id) else {
            return Err(BotError::not_found(format!(
                "no voice connection in group {group_id}"
            )));
        };
        self.set_joined(group_id, None);
        self.disconnect_voice(group_id, &slot).await;
        info!(%group_id, channel_id = %slot.channel.id, "left voice channel");
        Ok(())
    }

    /// Tear down the group's current voice connection, if any. Returns whether
    /// there was one. Callers hold the group lock.
    async fn force_leave(&self, group_id: &str) -> bool {
        let Some((_, slot)) = self.inner.voice.remove(group_id) else {
            return false;
        };
        self.set_joined(group_id, None);
        debug!(%group_id, channel_id = %slot.channel.id, "leaving current channel");
        self.disconnect_voice(group_id, &slot).await;
        true
    }

    async fn disconnect_voice(&self, group_id: &str, slot: &VoiceSlot) {
        if !slot.connection.is_connected() {
            return;
        }
        match timeout(self.inner.config.ack_timeout, slot.connection.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%group_id, error = %e, "voice disconnect failed"),
            Err(_) => warn!(
                %group_id,
                channel_id = %slot.channel.id,
                "voice disconnect was not acknowledged in time"
            ),
        }
    }

    // ── Observable state ────────────────────────────────────────────

    pub fn subscribe_groups(&self) -> watch::Receiver<Snapshot<Group>> {
        self.inner.groups.subscribe_groups()
    }

    pub fn subscribe_channels(&self, group_id: &str) -> watch::Receiver<Snapshot<Channel>> {
        self.inner.groups.subscribe_channels(group_id)
    }

    pub fn subscribe_joined(&self, group_id: &str) -> watch::Receiver<Option<Channel>> {
        self.prune_joined();
        self.inner
            .joined
            .entry(group_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().state == ConnectionState::Connected
    }

    pub fn groups(&self) -> Snapshot<Group> {
        self.inner.groups.groups()
    }

    pub fn channels(&self, group_id: &str) -> Snapshot<Channel> {
        self.inner.groups.channels(group_id)
    }

    pub fn joined_channel(&self, group_id: &str) -> Option<Channel> {
        self.inner.voice.get(group_id).map(|slot| slot.channel.clone())
    }

    /// Group ids with a running channel watcher.
    pub fn watched_groups(&self) -> Vec<GroupId> {
        self.inner.groups.running_channel_watchers()
    }

    /// Report activity, pushing back the idle logout.
    pub fn reset_activity(&self) {
        if let Some(monitor) = self.inner.activity.lock().as_ref() {
            monitor.reset();
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Serialize voice work on one group. The lock entry goes away with the
    /// last holder.
    async fn lock_group(&self, group_id: &str) -> GroupGuard<'_> {
        let lock = self
            .inner
            .group_locks
            .entry(group_id.to_string())
            .or_default()
            .clone();
        GroupGuard {
            locks: &self.inner.group_locks,
            group_id: group_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Forget joined-channel senders nobody listens to and that hold no channel.
    fn prune_joined(&self) {
        self.inner
            .joined
            .retain(|_, tx| tx.receiver_count() > 0 || tx.borrow().is_some());
    }

    fn joined_channel_id(&self, group_id: &str) -> Option<ChannelId> {
        self.inner.voice.get(group_id).map(|slot| slot.channel.id.clone())
    }

    fn set_joined(&self, group_id: &str, channel: Option<Channel>) {
        if channel.is_none() {
            if let Some(tx) = self.inner.joined.get(group_id) {
                tx.send_if_modified(|current| current.take().is_some());
            }
            self.inner
                .joined
                .remove_if(group_id, |_, tx| tx.receiver_count() == 0);
            return;
        }
        self.inner
            .joined
            .entry(group_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_if_modified(|current| {
                if *current == channel {
                    false
                } else {
                    *current = channel;
                    true
                }
            });
    }

    fn set_status(&self, state: ConnectionState) {
        self.inner.status.send_modify(|status| {
            status.state = state;
            if state != ConnectionState::Connected {
                status.connected_at = None;
            }
        });
    }
}
