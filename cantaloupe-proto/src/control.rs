use alloc::string::String;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{ChannelName, Subject};

/// Where a new subscription starts reading its channel
///
/// The position is resolved once, when the subscription is created.
/// Durable subscriptions honor it only on their first binding and
/// resume from their stored cursor afterwards.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Deliver only messages published after the subscribe
    #[default]
    NewOnly,
    /// Deliver starting with the last message currently in the channel
    LastReceived,
    /// Deliver starting from the oldest message younger than a delta
    TimeDeltaStart,
    /// Deliver starting from an explicit sequence
    SequenceStart,
    /// Deliver everything available in the channel
    First,
}

/// First request a client sends, on the discover subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub heartbeat_inbox: String,
}

/// Reply to [`ConnectRequest`], carrying the per-server control subjects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_prefix: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_requests: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsub_requests: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_requests: Option<Subject>,
    #[serde(default)]
    pub error: String,
}

/// Publish request, sent on `<pub_prefix>.<channel>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubMsg {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub payload: Bytes,
}

/// Reply to [`PubMsg`], echoing the guid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAck {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub error: String,
}

/// Subscribe request, sent on the server's subscribe subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub channel: String,
    /// Subject the broker pushes data messages to
    #[serde(default)]
    pub inbox: String,
    #[serde(default)]
    pub durable_name: String,
    #[serde(default)]
    pub q_group: String,
    #[serde(default)]
    pub ack_wait_secs: i32,
    #[serde(default)]
    pub max_in_flight: i32,
    #[serde(default)]
    pub start_position: StartPosition,
    /// Only meaningful with [`StartPosition::SequenceStart`]
    #[serde(default)]
    pub start_sequence: u64,
    /// Only meaningful with [`StartPosition::TimeDeltaStart`]
    #[serde(default)]
    pub start_time_delta_nanos: i64,
}

/// Reply to [`SubscriptionRequest`] and [`UnsubscribeRequest`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_inbox: Option<Subject>,
    #[serde(default)]
    pub error: String,
}

/// Unsubscribe request, sent on the server's unsubscribe subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub channel: String,
    /// Names the subscription being removed
    #[serde(default)]
    pub ack_inbox: String,
}

/// Close request, sent on the server's close subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {
    #[serde(default)]
    pub client_id: String,
}

/// Reply to [`CloseRequest`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseResponse {
    #[serde(default)]
    pub error: String,
}

/// Acknowledgement of one delivered sequence, sent on the
/// subscription's ack inbox. Not replied to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub sequence: u64,
}

/// A data message pushed to a subscription's delivery inbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgProto {
    pub channel: ChannelName,
    pub sequence: u64,
    pub payload: Bytes,
    /// Broker-assigned, nanoseconds since the unix epoch
    pub timestamp_nanos: i64,
    /// Set on every retransmission
    #[serde(default)]
    pub redelivered: bool,
}

/// An error encountered while decoding a control frame
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
#[error("malformed control frame")]
pub struct DecodeError(());

/// Encode a control frame as bus payload bytes
#[expect(
    clippy::missing_panics_doc,
    reason = "string/integer serialization is infallible"
)]
#[must_use]
pub fn encode<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).expect("control frame serialization"))
}

/// Decode a control frame from bus payload bytes
///
/// # Errors
///
/// It returns an error if `payload` isn't a valid frame of type `T`.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|_| DecodeError(()))
}
