use std::time::Duration;

use bytes::Bytes;
use cantaloupe_proto::{ChannelName, ClientId, Subject};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use self::file::FileStore;
pub use self::memory::MemoryStore;

mod file;
mod memory;

/// A message as kept in a channel's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sequence: u64,
    pub payload: Bytes,
    /// Broker-assigned, nanoseconds since the unix epoch
    pub timestamp_nanos: i64,
}

/// A connected client as kept in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub hb_inbox: Subject,
}

/// The durable identity and cursor of one subscription
///
/// This is what survives restarts; the in-flight send times and the
/// ack timer are runtime state rebuilt on recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: u64,
    pub client_id: ClientId,
    pub channel: ChannelName,
    /// Delivery inbox; rebound on durable resume
    pub inbox: Subject,
    pub ack_inbox: Subject,
    #[serde(default)]
    pub durable_name: Option<String>,
    #[serde(default)]
    pub queue_group: Option<String>,
    pub ack_wait: Duration,
    pub max_in_flight: usize,
    pub last_sent: u64,
    /// A detached durable pauses delivery but keeps its slot
    #[serde(default)]
    pub is_detached: bool,
}

/// One recovered subscription with its unacknowledged sequences
#[derive(Debug, Clone)]
pub struct RecoveredSubscription {
    pub record: SubscriptionRecord,
    pub pending: Vec<u64>,
}

/// One recovered channel
#[derive(Debug, Clone)]
pub struct RecoveredChannel {
    pub name: ChannelName,
    pub subscriptions: Vec<RecoveredSubscription>,
}

/// Everything the store had persisted before a restart
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    pub clients: Vec<ClientRecord>,
    pub channels: Vec<RecoveredChannel>,
}

/// Persistence backend contract
///
/// The broker calls the store synchronously and never while holding
/// any of its runtime locks, so implementations are free to block on
/// io. Limit enforcement lives here: `create_channel` and
/// `create_sub` reject past `max_channels`/`max_subscriptions`, and
/// `store_msg` evicts the oldest entries past the message log bounds.
pub trait Store: Send + Sync + 'static {
    /// Report state persisted by a previous run, if any
    ///
    /// Called once, before any other method.
    fn recover(&self) -> Result<Option<RecoveredState>>;

    fn has_channel(&self, channel: &ChannelName) -> bool;

    fn create_channel(&self, channel: &ChannelName) -> Result<()>;

    /// Append a message, assigning the next sequence
    fn store_msg(&self, channel: &ChannelName, payload: Bytes, timestamp_nanos: i64)
        -> Result<u64>;

    /// Look up one message; `None` if the sequence was never assigned
    /// or its message has been evicted
    fn lookup_msg(&self, channel: &ChannelName, sequence: u64) -> Result<Option<StoredMessage>>;

    /// Oldest stored sequence, `last_sequence + 1` when the log is empty
    fn first_sequence(&self, channel: &ChannelName) -> Result<u64>;

    /// Newest assigned sequence, `0` when nothing was ever stored
    fn last_sequence(&self, channel: &ChannelName) -> Result<u64>;

    /// Oldest stored sequence whose timestamp is at or past the given
    /// one, `last_sequence + 1` if every stored message is older
    fn sequence_for_timestamp(
        &self,
        channel: &ChannelName,
        timestamp_nanos: i64,
    ) -> Result<u64>;

    fn create_sub(&self, record: &SubscriptionRecord) -> Result<()>;

    fn update_sub(&self, record: &SubscriptionRecord) -> Result<()>;

    fn delete_sub(&self, channel: &ChannelName, sub_id: u64) -> Result<()>;

    /// Record a sequence as sent and unacknowledged
    fn add_seq_pending(&self, channel: &ChannelName, sub_id: u64, sequence: u64) -> Result<()>;

    /// Record a sequence as acknowledged
    fn ack_seq_pending(&self, channel: &ChannelName, sub_id: u64, sequence: u64) -> Result<()>;

    fn add_client(&self, record: &ClientRecord) -> Result<()>;

    fn delete_client(&self, client_id: &ClientId) -> Result<()>;

    /// Flush and release resources; further calls may fail
    fn close(&self) -> Result<()>;
}
