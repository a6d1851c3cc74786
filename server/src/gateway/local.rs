use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::ready;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{GatewayClient, GatewayConnection, GatewayError, SelfEvent, VoiceConnection};
use crate::audio::AudioProvider;
use crate::config::GatewaySection;
use crate::engine::models::{Channel, Group, GroupId};
use crate::engine::reconciler::ResourceEvent;

/// Capacity of each event broadcast. Slow subscribers skip lagged events.
const EVENT_BUFFER: usize = 256;

/// In-process gateway backed by an in-memory directory of groups and channels.
///
/// Directory mutations are broadcast to every live connection as events, the
/// same way a remote gateway pushes them. The knobs (`set_fail_logins`,
/// `set_join_delay`, `set_ack_delay`, `drop_connections`, `drop_voice`) simulate
/// an unreliable remote side.
#[derive(Clone)]
pub struct LocalGateway {
    shared: Arc<Shared>,
}

struct Shared {
    groups: DashMap<GroupId, Group>,
    channels: DashMap<GroupId, Vec<Channel>>,
    group_tx: broadcast::Sender<ResourceEvent<Group>>,
    channel_tx: broadcast::Sender<ResourceEvent<Channel>>,
    self_tx: broadcast::Sender<SelfEvent>,
    connections: Mutex<Vec<Arc<LocalConnection>>>,
    voices: Mutex<Vec<Arc<LocalVoiceConnection>>>,
    next_connection_id: AtomicU64,
    fail_logins: AtomicBool,
    join_delay: Mutex<Duration>,
    ack_delay: Mutex<Duration>,
    logins: AtomicUsize,
    logouts: AtomicUsize,
    joins: AtomicUsize,
}

impl LocalGateway {
    pub fn new(groups: Vec<Group>, channels: Vec<Channel>) -> Self {
        let (group_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (channel_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (self_tx, _) = broadcast::channel(EVENT_BUFFER);

        let shared = Shared {
            groups: DashMap::new(),
            channels: DashMap::new(),
            group_tx,
            channel_tx,
            self_tx,
            connections: Mutex::new(Vec::new()),
            voices: Mutex::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
            fail_logins: AtomicBool::new(false),
            join_delay: Mutex::new(Duration::ZERO),
            ack_delay: Mutex::new(Duration::ZERO),
            logins: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            joins: AtomicUsize::new(0),
        };

        for group in groups {
            shared.channels.entry(group.id.clone()).or_default();
            shared.groups.insert(group.id.clone(), group);
        }
        for channel in channels {
            shared
                .channels
                .entry(channel.group_id.clone())
                .or_default()
                .push(channel);
        }

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Build the directory from the `[gateway]` config section.
    pub fn from_config(section: &GatewaySection) -> Self {
        let groups = section
            .groups
            .iter()
            .map(|g| Group::new(g.id.clone(), g.name.clone()))
            .collect();
        let channels = section
            .groups
            .iter()
            .flat_map(|g| {
                g.channels.iter().map(|c| Channel {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    group_id: g.id.clone(),
                    kind: c.kind,
                })
            })
            .collect();
        Self::new(groups, channels)
    }

    // ── Directory mutations ─────────────────────────────────────────

    /// Add or rename a group.
    pub fn upsert_group(&self, group: Group) {
        let existed = self
            .shared
            .groups
            .insert(group.id.clone(), group.clone())
            .is_some();
        self.shared.channels.entry(group.id.clone()).or_default();
        let event = if existed {
            ResourceEvent::Update(group)
        } else {
            ResourceEvent::Create(group)
        };
        let _ = self.shared.group_tx.send(event);
    }

    /// Remove a group, as if the bot had been kicked from it.
    pub fn remove_group(&self, group_id: &str) {
        let Some((_, group)) = self.shared.groups.remove(group_id) else {
            return;
        };
        self.shared.channels.remove(group_id);
        let _ = self.shared.group_tx.send(ResourceEvent::Delete(group));
        let _ = self.shared.self_tx.send(SelfEvent::LeftGroup {
            group_id: group_id.to_string(),
        });
    }

    /// Add, rename or retype a channel.
    pub fn upsert_channel(&self, channel: Channel) {
        let mut channels = self
            .shared
            .channels
            .entry(channel.group_id.clone())
            .or_default();
        let event = match channels.iter().position(|c| c.id == channel.id) {
            Some(index) => {
                channels[index] = channel.clone();
                ResourceEvent::Update(channel)
            }
            None => {
                channels.push(channel.clone());
                ResourceEvent::Create(channel)
            }
        };
        drop(channels);
        let _ = self.shared.channel_tx.send(event);
    }

    pub fn remove_channel(&self, group_id: &str, channel_id: &str) {
        let removed = self.shared.channels.get_mut(group_id).and_then(|mut channels| {
            let index = channels.iter().position(|c| c.id == channel_id)?;
            Some(channels.remove(index))
        });
        if let Some(channel) = removed {
            let _ = self.shared.channel_tx.send(ResourceEvent::Delete(channel));
        }
    }

    // ── Failure simulation ──────────────────────────────────────────

    /// Drop every live connection from the remote side.
    pub fn drop_connections(&self) {
        let connections: Vec<_> = self.shared.connections.lock().drain(..).collect();
        for connection in connections {
            info!(connection_id = connection.id, "dropping gateway connection");
            connection.close();
        }
    }

    /// Drop the bot's voice connections in a group from the remote side.
    pub fn drop_voice(&self, group_id: &str) {
        let voices: Vec<_> = self
            .shared
            .voices
            .lock()
            .iter()
            .filter(|v| v.group_id == group_id && v.is_connected())
            .cloned()
            .collect();
        for voice in voices {
            voice.mark_disconnected();
        }
    }

    pub fn set_fail_logins(&self, fail: bool) {
        self.shared.fail_logins.store(fail, Ordering::SeqCst);
    }

    /// Delay before a voice join is acknowledged.
    pub fn set_join_delay(&self, delay: Duration) {
        *self.shared.join_delay.lock() = delay;
    }

    /// Delay before logout and voice disconnect are acknowledged.
    pub fn set_ack_delay(&self, delay: Duration) {
        *self.shared.ack_delay.lock() = delay;
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn login_count(&self) -> usize {
        self.shared.logins.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> usize {
        self.shared.logouts.load(Ordering::SeqCst)
    }

    pub fn join_count(&self) -> usize {
        self.shared.joins.load(Ordering::SeqCst)
    }

    /// Voice connections the gateway still tracks, in any group.
    pub fn tracked_voice_connections(&self) -> usize {
        self.shared.voices.lock().len()
    }

    /// Channel ids of the connected voice connections in a group.
    pub fn active_voice_channels(&self, group_id: &str) -> Vec<String> {
        self.shared
            .voices
            .lock()
            .iter()
            .filter(|v| v.group_id == group_id && v.is_connected())
            .map(|v| v.channel_id.clone())
            .collect()
    }
}

#[async_trait]
impl GatewayClient for LocalGateway {
    async fn login(&self) -> Result<Arc<dyn GatewayConnection>, GatewayError> {
        self.shared.logins.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_logins.load(Ordering::SeqCst) {
            return Err(GatewayError::Login("gateway refused the login".into()));
        }

        let connection = Arc::new(LocalConnection {
            id: self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst),
            shared: self.shared.clone(),
            closed: CancellationToken::new(),
        });
        self.shared.connections.lock().push(connection.clone());
        debug!(connection_id = connection.id, "gateway login accepted");
        Ok(connection)
    }
}

pub struct LocalConnection {
    id: u64,
    shared: Arc<Shared>,
    closed: CancellationToken,
}

impl LocalConnection {
    fn close(&self) {
        self.closed.cancel();
        self.shared.voices.lock().retain(|voice| {
            if voice.connection_id != self.id {
                return true;
            }
            voice.connected.store(false, Ordering::SeqCst);
            false
        });
    }

    fn ensure_open(&self) -> Result<(), GatewayError> {
        if self.closed.is_cancelled() {
            Err(GatewayError::Closed)
        } else {
            Ok(())
        }
    }

    fn live<T: Send + 'static>(&self, rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
    where
        T: Clone,
    {
        BroadcastStream::new(rx)
            .filter_map(|event| ready(event.ok()))
            .take_until(self.closed.clone().cancelled_owned())
            .boxed()
    }
}

#[async_trait]
impl GatewayConnection for LocalConnection {
    async fn logout(&self) -> Result<(), GatewayError> {
        let delay = *self.shared.ack_delay.lock();
        tokio::time::sleep(delay).await;
        self.shared.logouts.fetch_add(1, Ordering::SeqCst);
        self.shared
            .connections
            .lock()
            .retain(|c| c.id != self.id);
        self.close();
        Ok(())
    }

    async fn disconnected(&self) {
        self.closed.cancelled().await;
    }

    async fn fetch_groups(&self) -> Result<Vec<Group>, GatewayError> {
        self.ensure_open()?;
        Ok(self.shared.groups.iter().map(|g| g.value().clone()).collect())
    }

    fn group_events(&self) -> BoxStream<'static, ResourceEvent<Group>> {
        self.live(self.shared.group_tx.subscribe())
    }

    async fn fetch_channels(&self, group_id: &str) -> Result<Vec<Channel>, GatewayError> {
        self.ensure_open()?;
        self.shared
            .channels
            .get(group_id)
            .map(|channels| channels.clone())
            .ok_or_else(|| GatewayError::UnknownGroup(group_id.to_string()))
    }

    fn channel_events(&self, group_id: &str) -> BoxStream<'static, ResourceEvent<Channel>> {
        let group_id = group_id.to_string();
        self.live(self.shared.channel_tx.subscribe())
            .filter(move |event| {
                let channel = match event {
                    ResourceEvent::Create(c) | ResourceEvent::Update(c) | ResourceEvent::Delete(c) => c,
                };
                ready(channel.group_id == group_id)
            })
            .boxed()
    }

    async fn resolve_channel(
        &self,
        group_id: &str,
        channel_id: &str,
    ) -> Result<Channel, GatewayError> {
        self.ensure_open()?;
        let channels = self
            .shared
            .channels
            .get(group_id)
            .ok_or_else(|| GatewayError::UnknownGroup(group_id.to_string()))?;
        channels
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownChannel {
                group_id: group_id.to_string(),
                channel_id: channel_id.to_string(),
            })
    }

    async fn join_voice(
        &self,
        group_id: &str,
        channel_id: &str,
        provider: Arc<dyn AudioProvider>,
    ) -> Result<Arc<dyn VoiceConnection>, GatewayError> {
        self.shared.joins.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shared.join_delay.lock();
        tokio::time::sleep(delay).await;
        self.ensure_open()?;

        let voice = Arc::new(LocalVoiceConnection {
            connection_id: self.id,
            group_id: group_id.to_string(),
            channel_id: channel_id.to_string(),
            connected: AtomicBool::new(true),
            _provider: provider,
            shared: self.shared.clone(),
        });
        self.shared.voices.lock().push(voice.clone());
        Ok(voice)
    }

    fn self_events(&self) -> BoxStream<'static, SelfEvent> {
        self.live(self.shared.self_tx.subscribe())
    }
}

pub struct LocalVoiceConnection {
    connection_id: u64,
    group_id: GroupId,
    channel_id: String,
    connected: AtomicBool,
    _provider: Arc<dyn AudioProvider>,
    shared: Arc<Shared>,
}

impl LocalVoiceConnection {
    /// Flag the connection as gone and stop tracking it. Only the first call
    /// emits `VoiceDisconnected`.
    fn mark_disconnected(&self) {
        self.shared
            .voices
            .lock()
            .retain(|voice| !std::ptr::eq(voice.as_ref(), self));
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.shared.self_tx.send(SelfEvent::VoiceDisconnected {
                group_id: self.group_id.clone(),
                channel_id: self.channel_id.clone(),
            });
        }
    }
}

#[async_trait]
impl VoiceConnection for LocalVoiceConnection {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        let delay = *self.shared.ack_delay.lock();
        tokio::time::sleep(delay).await;
        self.mark_disconnected();
        Ok(())
    }
}
