//! Typed datafeed events.
//!
//! Events arrive as a `{type, initiator, payload}` envelope. The envelope is
//! decoded into [`FeedEvent`] with a closed [`EventPayload`] enum; kinds this
//! crate does not know about decode to [`EventPayload::Unknown`] rather than
//! failing the whole batch.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: i64,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Initiator {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub stream_id: String,
    #[serde(default)]
    pub stream_type: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Markup body of the message.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<String>,
    pub stream: Stream,
}

impl Message {
    /// Message body with markup removed, entities decoded and surrounding
    /// whitespace trimmed.
    pub fn text(&self) -> String {
        strip_markup(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSuppressed {
    pub message_id: String,
    #[serde(default)]
    pub stream: Option<Stream>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedPost {
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub stream: Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEvent {
    pub stream: Stream,
    pub affected_user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequested {
    pub to_user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAccepted {
    pub from_user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementsAction {
    pub stream: Stream,
    pub form_message_id: String,
    pub form_id: String,
    #[serde(default)]
    pub form_values: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    MessageSent(MessageSent),
    MessageSuppressed(MessageSuppressed),
    SharedPost(SharedPost),
    InstantMessageCreated(StreamEvent),
    RoomCreated(StreamEvent),
    RoomUpdated(StreamEvent),
    RoomDeactivated(StreamEvent),
    RoomReactivated(StreamEvent),
    UserJoinedRoom(MembershipEvent),
    UserLeftRoom(MembershipEvent),
    RoomMemberPromotedToOwner(MembershipEvent),
    RoomMemberDemotedFromOwner(MembershipEvent),
    ConnectionRequested(ConnectionRequested),
    ConnectionAccepted(ConnectionAccepted),
    ElementsAction(ElementsAction),
    Unknown { kind: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageSent,
    MessageSuppressed,
    SharedPost,
    InstantMessageCreated,
    RoomCreated,
    RoomUpdated,
    RoomDeactivated,
    RoomReactivated,
    UserJoinedRoom,
    UserLeftRoom,
    RoomMemberPromotedToOwner,
    RoomMemberDemotedFromOwner,
    ConnectionRequested,
    ConnectionAccepted,
    ElementsAction,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageSent => "message-sent",
            EventKind::MessageSuppressed => "message-suppressed",
            EventKind::SharedPost => "shared-post",
            EventKind::InstantMessageCreated => "instant-message-created",
            EventKind::RoomCreated => "room-created",
            EventKind::RoomUpdated => "room-updated",
            EventKind::RoomDeactivated => "room-deactivated",
            EventKind::RoomReactivated => "room-reactivated",
            EventKind::UserJoinedRoom => "user-joined-room",
            EventKind::UserLeftRoom => "user-left-room",
            EventKind::RoomMemberPromotedToOwner => "room-member-promoted-to-owner",
            EventKind::RoomMemberDemotedFromOwner => "room-member-demoted-from-owner",
            EventKind::ConnectionRequested => "connection-requested",
            EventKind::ConnectionAccepted => "connection-accepted",
            EventKind::ElementsAction => "elements-action",
            EventKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::MessageSent(_) => EventKind::MessageSent,
            EventPayload::MessageSuppressed(_) => EventKind::MessageSuppressed,
            EventPayload::SharedPost(_) => EventKind::SharedPost,
            EventPayload::InstantMessageCreated(_) => EventKind::InstantMessageCreated,
            EventPayload::RoomCreated(_) => EventKind::RoomCreated,
            EventPayload::RoomUpdated(_) => EventKind::RoomUpdated,
            EventPayload::RoomDeactivated(_) => EventKind::RoomDeactivated,
            EventPayload::RoomReactivated(_) => EventKind::RoomReactivated,
            EventPayload::UserJoinedRoom(_) => EventKind::UserJoinedRoom,
            EventPayload::UserLeftRoom(_) => EventKind::UserLeftRoom,
            EventPayload::RoomMemberPromotedToOwner(_) => EventKind::RoomMemberPromotedToOwner,
            EventPayload::RoomMemberDemotedFromOwner(_) => EventKind::RoomMemberDemotedFromOwner,
            EventPayload::ConnectionRequested(_) => EventKind::ConnectionRequested,
            EventPayload::ConnectionAccepted(_) => EventKind::ConnectionAccepted,
            EventPayload::ElementsAction(_) => EventKind::ElementsAction,
            EventPayload::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// The message carried by message-bearing payloads.
    pub fn message(&self) -> Option<&Message> {
        match self {
            EventPayload::MessageSent(sent) => Some(&sent.message),
            EventPayload::SharedPost(post) => Some(&post.message),
            _ => None,
        }
    }

    /// Stream the event happened in, when it has one.
    pub fn stream(&self) -> Option<&Stream> {
        match self {
            EventPayload::MessageSent(sent) => Some(&sent.message.stream),
            EventPayload::SharedPost(post) => Some(&post.message.stream),
            EventPayload::MessageSuppressed(suppressed) => suppressed.stream.as_ref(),
            EventPayload::InstantMessageCreated(e)
            | EventPayload::RoomCreated(e)
            | EventPayload::RoomUpdated(e)
            | EventPayload::RoomDeactivated(e)
            | EventPayload::RoomReactivated(e) => Some(&e.stream),
            EventPayload::UserJoinedRoom(e)
            | EventPayload::UserLeftRoom(e)
            | EventPayload::RoomMemberPromotedToOwner(e)
            | EventPayload::RoomMemberDemotedFromOwner(e) => Some(&e.stream),
            EventPayload::ElementsAction(action) => Some(&action.stream),
            EventPayload::ConnectionRequested(_)
            | EventPayload::ConnectionAccepted(_)
            | EventPayload::Unknown { .. } => None,
        }
    }
}

/// One event delivered by the datafeed. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub id: String,
    pub timestamp: Option<i64>,
    pub initiator: Initiator,
    pub payload: EventPayload,
}

impl FeedEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn initiator_id(&self) -> i64 {
        self.initiator.user.user_id
    }
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    initiator: Initiator,
    #[serde(default)]
    payload: Value,
}

impl<'de> Deserialize<'de> for FeedEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEvent::deserialize(deserializer)?;
        let payload = decode_payload(&raw.kind, raw.payload).map_err(D::Error::custom)?;
        Ok(FeedEvent {
            id: raw.id,
            timestamp: raw.timestamp,
            initiator: raw.initiator,
            payload,
        })
    }
}

fn part<T: DeserializeOwned>(payload: &mut Value, key: &str) -> Result<T, serde_json::Error> {
    let value = payload
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| serde_json::Error::custom(format!("missing payload.{}", key)))?;
    serde_json::from_value(value)
}

fn decode_payload(kind: &str, mut payload: Value) -> Result<EventPayload, serde_json::Error> {
    let p = &mut payload;
    Ok(match kind {
        "MESSAGESENT" => EventPayload::MessageSent(part(p, "messageSent")?),
        "MESSAGESUPPRESSED" => EventPayload::MessageSuppressed(part(p, "messageSuppressed")?),
        "SHAREDPOST" => EventPayload::SharedPost(part(p, "sharedPost")?),
        "INSTANTMESSAGECREATED" => {
            EventPayload::InstantMessageCreated(part(p, "instantMessageCreated")?)
        }
        "ROOMCREATED" => EventPayload::RoomCreated(part(p, "roomCreated")?),
        "ROOMUPDATED" => EventPayload::RoomUpdated(part(p, "roomUpdated")?),
        "ROOMDEACTIVATED" => EventPayload::RoomDeactivated(part(p, "roomDeactivated")?),
        "ROOMREACTIVATED" => EventPayload::RoomReactivated(part(p, "roomReactivated")?),
        "USERJOINEDROOM" => EventPayload::UserJoinedRoom(part(p, "userJoinedRoom")?),
        "USERLEFTROOM" => EventPayload::UserLeftRoom(part(p, "userLeftRoom")?),
        "ROOMMEMBERPROMOTEDTOOWNER" => {
            EventPayload::RoomMemberPromotedToOwner(part(p, "roomMemberPromotedToOwner")?)
        }
        "ROOMMEMBERDEMOTEDFROMOWNER" => {
            EventPayload::RoomMemberDemotedFromOwner(part(p, "roomMemberDemotedFromOwner")?)
        }
        "CONNECTIONREQUESTED" => {
            EventPayload::ConnectionRequested(part(p, "connectionRequested")?)
        }
        "CONNECTIONACCEPTED" => EventPayload::ConnectionAccepted(part(p, "connectionAccepted")?),
        "SYMPHONYELEMENTSACTION" => {
            EventPayload::ElementsAction(part(p, "symphonyElementsAction")?)
        }
        other => EventPayload::Unknown {
            kind: other.to_string(),
        },
    })
}

fn strip_markup(markup: &str) -> String {
    let mut text = String::with_capacity(markup.len());
    let mut in_tag = false;
    for c in markup.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}
