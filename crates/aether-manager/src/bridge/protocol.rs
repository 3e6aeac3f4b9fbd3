//! Wire protocol types for manager-supervisor communication.
//!
//! Every frame on the control channel carries one [`Envelope`]: an event tag, an
//! opaque JSON payload and, for correlated request/reply pairs, a nonce.
//! Payload types below are decoded from (or encoded into) `Envelope::data`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type ClusterId = u32;
pub type ShardId = u32;

/// Event tags understood by this build.
///
/// Tags outside this set decode to `DecodeError::UnknownType` and are dropped,
/// so the supervisor can roll out new directives before every manager knows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RestartClient,
    GuildCreate,
    GuildDelete,
    ReadyClient,
    DiscoveryUpdate,
    RequestReply,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::RestartClient,
        EventType::GuildCreate,
        EventType::GuildDelete,
        EventType::ReadyClient,
        EventType::DiscoveryUpdate,
        EventType::RequestReply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestartClient => "RESTART_CLIENT",
            Self::GuildCreate => "GUILD_CREATE",
            Self::GuildDelete => "GUILD_DELETE",
            Self::ReadyClient => "READY_CLIENT",
            Self::DiscoveryUpdate => "DISCOVERY_UPDATE",
            Self::RequestReply => "REQUEST_REPLY",
        }
    }

    /// Look up a tag by its wire name.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Correlation id; set only on request/reply pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl Envelope {
    pub fn new(kind: EventType, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            nonce: None,
        }
    }

    /// Build an envelope from a typed payload.
    pub fn from_payload<T: Serialize>(kind: EventType, payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

/// Supervisor-defined fleet state. Stored and echoed back, never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FleetState(serde_json::Value);

impl FleetState {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// `RESTART_CLIENT` payload.
///
/// The shape is decided once, when the payload is decoded: `{"force": true}` is
/// [`RestartDirective::Forced`], anything else must carry the full set of
/// expected values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RestartPayload", into = "RestartPayload")]
pub enum RestartDirective {
    Forced,
    Conditional(ConditionalRestart),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalRestart {
    pub target_cluster_id: ClusterId,
    pub expected_shard_count: u32,
    pub expected_shards: BTreeSet<ShardId>,
    pub session: String,
    pub state: FleetState,
}

#[derive(Debug, thiserror::Error)]
#[error("conditional restart is missing `{0}`")]
pub struct MissingField(&'static str);

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartPayload {
    #[serde(default)]
    force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<ClusterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shard_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shards: Option<Vec<ShardId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<serde_json::Value>,
}

impl TryFrom<RestartPayload> for RestartDirective {
    type Error = MissingField;

    fn try_from(payload: RestartPayload) -> Result<Self, Self::Error> {
        if payload.force {
            return Ok(Self::Forced);
        }
        Ok(Self::Conditional(ConditionalRestart {
            target_cluster_id: payload.id.ok_or(MissingField("id"))?,
            expected_shard_count: payload.shard_count.ok_or(MissingField("shardCount"))?,
            expected_shards: payload
                .shards
                .ok_or(MissingField("shards"))?
                .into_iter()
                .collect(),
            session: payload.session.ok_or(MissingField("session"))?,
            state: FleetState(payload.state.ok_or(MissingField("state"))?),
        }))
    }
}

impl From<RestartDirective> for RestartPayload {
    fn from(directive: RestartDirective) -> Self {
        match directive {
            RestartDirective::Forced => Self {
                force: true,
                id: None,
                shard_count: None,
                shards: None,
                session: None,
                state: None,
            },
            RestartDirective::Conditional(c) => Self {
                force: false,
                id: Some(c.target_cluster_id),
                shard_count: Some(c.expected_shard_count),
                shards: Some(c.expected_shards.into_iter().collect()),
                session: Some(c.session),
                state: Some(c.state.0),
            },
        }
    }
}

/// Minimal summary of this manager's presence in a guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSnapshot {
    pub id: String,
    pub present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

/// `GUILD_CREATE` payload: one locally-owned resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub member: OwnerSnapshot,
}

/// Inbound `GUILD_CREATE` payload: the record plus an optional discovery listing.
///
/// The listing is kept beside the record and only ever goes out in
/// `DISCOVERY_UPDATE`, never back out in `GUILD_CREATE`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceAnnouncement {
    #[serde(flatten)]
    pub record: ResourceRecord,
    #[serde(default)]
    pub discovery: Option<DiscoverableResource>,
}

/// `GUILD_DELETE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGone {
    pub id: String,
}

/// One entry of a `DISCOVERY_UPDATE` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverableResource {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub members: u64,
}

/// Commands advertised in the readiness handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandManifest {
    #[serde(default)]
    pub all: Vec<serde_json::Value>,
    #[serde(default)]
    pub enabled: Vec<serde_json::Value>,
}

/// `READY_CLIENT` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyClient {
    pub avatar: String,
    pub all_commands: Vec<serde_json::Value>,
    pub commands: Vec<serde_json::Value>,
    pub name: String,
    /// Cluster id of the sending manager.
    pub id: ClusterId,
    pub env: String,
    pub commit: String,
    /// Process tag assigned by the host process manager.
    pub uuid: Option<String>,
}
