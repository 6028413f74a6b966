use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use cantaloupe_proto::{ChannelName, ClientId, ProtocolError};

use crate::config::ChannelLimits;
use crate::error::{Error, Result};

use super::{
    ClientRecord, RecoveredChannel, RecoveredState, RecoveredSubscription, Store, StoredMessage,
    SubscriptionRecord,
};

/// A [`Store`] that keeps everything in process memory
///
/// Also serves as the working set of [`FileStore`], which replays its
/// logs into one of these on recovery.
///
/// [`FileStore`]: crate::store::FileStore
#[derive(Debug)]
pub struct MemoryStore {
    limits: ChannelLimits,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    channels: HashMap<ChannelName, ChannelState>,
    clients: HashMap<ClientId, ClientRecord>,
}

#[derive(Debug, Default)]
struct ChannelState {
    msgs: VecDeque<StoredMessage>,
    /// Sequence the next stored message gets; sequences start at 1
    next_seq: u64,
    bytes: u64,
    subs: HashMap<u64, SubEntry>,
}

#[derive(Debug)]
struct SubEntry {
    record: SubscriptionRecord,
    pending: BTreeSet<u64>,
    /// Highest sequence ever handed to this subscription; the
    /// recovered cursor is the max of this and the stored record's
    /// `last_sent`, so acked history is not re-sent after a restart
    max_assigned: u64,
}

impl MemoryStore {
    #[must_use]
    pub fn new(limits: ChannelLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-insert a message with its original sequence during recovery
    pub(crate) fn restore_msg(&self, channel: &ChannelName, msg: StoredMessage) -> Result<()> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;

        state.next_seq = msg.sequence + 1;
        state.bytes += msg.payload.len() as u64;
        state.msgs.push_back(msg);
        enforce_log_limits(state, &self.limits);
        Ok(())
    }

    /// Dump the working set in recovery form
    pub(crate) fn recovered_state(&self) -> RecoveredState {
        let inner = self.lock();

        let mut channels = inner
            .channels
            .iter()
            .map(|(name, state)| {
                let mut subscriptions = state
                    .subs
                    .values()
                    .map(|entry| {
                        let mut record = entry.record.clone();
                        record.last_sent = record.last_sent.max(entry.max_assigned);
                        RecoveredSubscription {
                            record,
                            pending: entry.pending.iter().copied().collect(),
                        }
                    })
                    .collect::<Vec<_>>();
                subscriptions.sort_by_key(|sub| sub.record.id);

                RecoveredChannel {
                    name: name.clone(),
                    subscriptions,
                }
            })
            .collect::<Vec<_>>();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        let mut clients = inner.clients.values().cloned().collect::<Vec<_>>();
        clients.sort_by(|a, b| a.id.cmp(&b.id));

        RecoveredState { clients, channels }
    }
}

impl Store for MemoryStore {
    fn recover(&self) -> Result<Option<RecoveredState>> {
        Ok(None)
    }

    fn has_channel(&self, channel: &ChannelName) -> bool {
        self.lock().channels.contains_key(channel)
    }

    fn create_channel(&self, channel: &ChannelName) -> Result<()> {
        let mut inner = self.lock();
        if inner.channels.contains_key(channel) {
            return Ok(());
        }

        if self.limits.max_channels > 0 && inner.channels.len() >= self.limits.max_channels {
            return Err(ProtocolError::TooManyChannels.into());
        }

        inner.channels.insert(
            channel.clone(),
            ChannelState {
                next_seq: 1,
                ..ChannelState::default()
            },
        );
        Ok(())
    }

    fn store_msg(
        &self,
        channel: &ChannelName,
        payload: Bytes,
        timestamp_nanos: i64,
    ) -> Result<u64> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;

        let sequence = state.next_seq;
        state.next_seq += 1;
        state.bytes += payload.len() as u64;
        state.msgs.push_back(StoredMessage {
            sequence,
            payload,
            timestamp_nanos,
        });
        enforce_log_limits(state, &self.limits);
        Ok(sequence)
    }

    fn lookup_msg(&self, channel: &ChannelName, sequence: u64) -> Result<Option<StoredMessage>> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;

        let Some(front) = state.msgs.front() else {
            return Ok(None);
        };
        if sequence < front.sequence {
            return Ok(None);
        }

        #[expect(clippy::cast_possible_truncation, reason = "bounded by msgs.len()")]
        let index = (sequence - front.sequence) as usize;
        Ok(state.msgs.get(index).cloned())
    }

    fn first_sequence(&self, channel: &ChannelName) -> Result<u64> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;
        Ok(state.msgs.front().map_or(state.next_seq, |msg| msg.sequence))
    }

    fn last_sequence(&self, channel: &ChannelName) -> Result<u64> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;
        Ok(state.next_seq - 1)
    }

    fn sequence_for_timestamp(&self, channel: &ChannelName, timestamp_nanos: i64) -> Result<u64> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;

        let found = state
            .msgs
            .iter()
            .find(|msg| msg.timestamp_nanos >= timestamp_nanos)
            .map(|msg| msg.sequence);
        Ok(found.unwrap_or(state.next_seq))
    }

    fn create_sub(&self, record: &SubscriptionRecord) -> Result<()> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, &record.channel)?;

        if self.limits.max_subscriptions > 0
            && !state.subs.contains_key(&record.id)
            && state.subs.len() >= self.limits.max_subscriptions
        {
            return Err(ProtocolError::TooManySubscriptions.into());
        }

        state.subs.insert(
            record.id,
            SubEntry {
                record: record.clone(),
                pending: BTreeSet::new(),
                max_assigned: record.last_sent,
            },
        );
        Ok(())
    }

    fn update_sub(&self, record: &SubscriptionRecord) -> Result<()> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, &record.channel)?;

        if let Some(entry) = state.subs.get_mut(&record.id) {
            entry.record = record.clone();
        }
        Ok(())
    }

    fn delete_sub(&self, channel: &ChannelName, sub_id: u64) -> Result<()> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;
        state.subs.remove(&sub_id);
        Ok(())
    }

    fn add_seq_pending(&self, channel: &ChannelName, sub_id: u64, sequence: u64) -> Result<()> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;
        if let Some(entry) = state.subs.get_mut(&sub_id) {
            entry.pending.insert(sequence);
            entry.max_assigned = entry.max_assigned.max(sequence);
        }
        Ok(())
    }

    fn ack_seq_pending(&self, channel: &ChannelName, sub_id: u64, sequence: u64) -> Result<()> {
        let mut inner = self.lock();
        let state = channel_mut(&mut inner, channel)?;
        if let Some(entry) = state.subs.get_mut(&sub_id) {
            entry.pending.remove(&sequence);
        }
        Ok(())
    }

    fn add_client(&self, record: &ClientRecord) -> Result<()> {
        self.lock().clients.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete_client(&self, client_id: &ClientId) -> Result<()> {
        self.lock().clients.remove(client_id);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn channel_mut<'a>(inner: &'a mut Inner, channel: &ChannelName) -> Result<&'a mut ChannelState> {
    inner
        .channels
        .get_mut(channel)
        .ok_or_else(|| Error::UnknownChannel(channel.clone()))
}

fn enforce_log_limits(state: &mut ChannelState, limits: &ChannelLimits) {
    while state.msgs.len() > limits.max_msgs && limits.max_msgs > 0 {
        pop_front(state);
    }
    while state.bytes > limits.max_bytes && limits.max_bytes > 0 {
        pop_front(state);
    }

    if !limits.max_age.is_zero() {
        #[expect(clippy::cast_possible_truncation, reason = "max_age fits i64 nanos")]
        let max_age_nanos = limits.max_age.as_nanos() as i64;
        let Some(newest) = state.msgs.back().map(|msg| msg.timestamp_nanos) else {
            return;
        };
        while state
            .msgs
            .front()
            .is_some_and(|msg| newest - msg.timestamp_nanos > max_age_nanos)
        {
            pop_front(state);
        }
    }
}

fn pop_front(state: &mut ChannelState) {
    if let Some(msg) = state.msgs.pop_front() {
        state.bytes -= msg.payload.len() as u64;
    }
}
