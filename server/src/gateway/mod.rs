//! Gateway Client collaborator: login/logout, membership event streams and
//! voice sub-connections on the remote service.
//!
//! The session supervisor only talks to these traits. [`local::LocalGateway`]
//! is the in-process backend used by the binary and the tests.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::audio::AudioProvider;
use crate::engine::models::{Channel, ChannelId, Group, GroupId};
use crate::engine::reconciler::ResourceEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("login rejected: {0}")]
    Login(String),

    #[error("connection closed")]
    Closed,

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("unknown channel {channel_id} in group {group_id}")]
    UnknownChannel {
        group_id: GroupId,
        channel_id: ChannelId,
    },

    #[error("request failed: {0}")]
    Request(String),
}

/// Events about the bot's own membership, emitted by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfEvent {
    /// The bot was kicked from, or otherwise left, a group.
    LeftGroup { group_id: GroupId },
    /// The bot's voice connection in a group was dropped externally.
    VoiceDisconnected {
        group_id: GroupId,
        channel_id: ChannelId,
    },
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Open a new authenticated connection.
    async fn login(&self) -> Result<Arc<dyn GatewayConnection>, GatewayError>;
}

/// One authenticated connection to the remote service.
#[async_trait]
pub trait GatewayConnection: Send + Sync {
    async fn logout(&self) -> Result<(), GatewayError>;

    /// Resolves once the remote side has dropped this connection.
    async fn disconnected(&self);

    async fn fetch_groups(&self) -> Result<Vec<Group>, GatewayError>;

    /// Live group events. The subscription starts when this is called.
    fn group_events(&self) -> BoxStream<'static, ResourceEvent<Group>>;

    /// All channels of a group, of any kind.
    async fn fetch_channels(&self, group_id: &str) -> Result<Vec<Channel>, GatewayError>;

    /// Live channel events for one group, of any kind.
    fn channel_events(&self, group_id: &str) -> BoxStream<'static, ResourceEvent<Channel>>;

    async fn resolve_channel(
        &self,
        group_id: &str,
        channel_id: &str,
    ) -> Result<Channel, GatewayError>;

    /// Connect voice to a channel; audio is pulled from `provider`.
    async fn join_voice(
        &self,
        group_id: &str,
        channel_id: &str,
        provider: Arc<dyn AudioProvider>,
    ) -> Result<Arc<dyn VoiceConnection>, GatewayError>;

    fn self_events(&self) -> BoxStream<'static, SelfEvent>;
}

/// A live voice sub-connection to one channel of one group.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn channel_id(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), GatewayError>;
}
