use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reconciler::Resource;

/// Identifier of a group (guild) on the remote service.
pub type GroupId = String;

/// Identifier of a channel within a group.
pub type ChannelId = String;

/// A top-level membership unit. Identity is `id`; `name` may change on rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

impl Group {
    pub fn new(id: impl Into<GroupId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl Resource for Group {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// What a channel can be used for. Only voice channels can be joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Voice,
    Text,
    Category,
}

/// A named sub-resource of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub group_id: GroupId,
    #[serde(default)]
    pub kind: ChannelKind,
}

impl Channel {
    pub fn voice(
        id: impl Into<ChannelId>,
        name: impl Into<String>,
        group_id: impl Into<GroupId>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            group_id: group_id.into(),
            kind: ChannelKind::Voice,
        }
    }

    pub fn text(
        id: impl Into<ChannelId>,
        name: impl Into<String>,
        group_id: impl Into<GroupId>,
    ) -> Self {
        Self {
            kind: ChannelKind::Text,
            ..Self::voice(id, name, group_id)
        }
    }

    pub fn is_voice(&self) -> bool {
        self.kind == ChannelKind::Voice
    }
}

impl Resource for Channel {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The track a group is currently playing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
}

/// Coarse bot state per group, as shown to the presentation layer.
///
/// Being logged in without having joined a channel is reported as `Offline`:
/// the gateway login is not a concern of the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Offline,
    JoinedIdle,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotStatus {
    pub state: BotState,
    pub joined_channel: Option<Channel>,
    pub playing_track: Option<TrackInfo>,
}

impl BotStatus {
    pub fn from_parts(joined_channel: Option<Channel>, playing_track: Option<TrackInfo>) -> Self {
        let state = match (&joined_channel, &playing_track) {
            (None, _) => BotState::Offline,
            (Some(_), None) => BotState::JoinedIdle,
            (Some(_), Some(_)) => BotState::Playing,
        };
        Self {
            state,
            joined_channel,
            playing_track,
        }
    }
}

/// Connection state machine of the session supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

/// A playable file of the sound library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sound {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Resource for Sound {
    fn id(&self) -> &str {
        &self.filename
    }

    fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.filename)
    }
}
