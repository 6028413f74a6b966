use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use cantaloupe_proto::{
    ChannelName, ClientId, ProtocolError, StartPosition, Subject, SubscriptionRequest,
};
use tokio::{task::JoinHandle, time::Instant};

use crate::error::Result;
use crate::store::{Store, SubscriptionRecord};

/// Runtime state of one subscription
///
/// The immutable identity lives on the struct; everything the
/// delivery engine mutates sits behind the state lock. Channel
/// directory, client record and queue state all hold this through an
/// `Arc` keyed by the stable `id`, there are no back references.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) client_id: ClientId,
    pub(crate) channel: ChannelName,
    pub(crate) durable_name: Option<String>,
    pub(crate) queue_group: Option<String>,
    pub(crate) ack_wait: Duration,
    pub(crate) max_in_flight: usize,
    state: Mutex<SubState>,
}

#[derive(Debug)]
pub(crate) struct SubState {
    /// Delivery inbox; rebound on durable resume
    pub(crate) inbox: Subject,
    pub(crate) ack_inbox: Subject,
    pub(crate) last_sent: u64,
    /// Sequences sent and not yet acked, keyed to their most recent
    /// send time
    pub(crate) pending: BTreeMap<u64, Instant>,
    /// False only for a detached durable
    pub(crate) attached: bool,
    pub(crate) ack_timer: Option<JoinHandle<()>>,
    /// Task draining the ack inbox bus subscription
    pub(crate) ack_dispatch: Option<JoinHandle<()>>,
}

impl Subscription {
    #[expect(clippy::too_many_arguments, reason = "construction site is a validated handler")]
    pub(crate) fn new(
        id: u64,
        client_id: ClientId,
        channel: ChannelName,
        inbox: Subject,
        ack_inbox: Subject,
        durable_name: Option<String>,
        queue_group: Option<String>,
        ack_wait: Duration,
        max_in_flight: usize,
        last_sent: u64,
    ) -> Self {
        Self {
            id,
            client_id,
            channel,
            durable_name,
            queue_group,
            ack_wait,
            max_in_flight,
            state: Mutex::new(SubState {
                inbox,
                ack_inbox,
                last_sent,
                pending: BTreeMap::new(),
                attached: true,
                ack_timer: None,
                ack_dispatch: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.durable_name.is_some()
    }

    pub(crate) fn ack_inbox(&self) -> Subject {
        self.state().ack_inbox.clone()
    }

    /// Remove one acked sequence; stops the ack timer when the
    /// in-flight set drains
    pub(crate) fn ack(&self, sequence: u64) -> bool {
        let timer = {
            let mut state = self.state();
            if state.pending.remove(&sequence).is_none() {
                return false;
            }
            if state.pending.is_empty() {
                state.ack_timer.take()
            } else {
                None
            }
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        true
    }

    /// Pause delivery while keeping identity, cursor and in-flight set
    ///
    /// Only meaningful for durables; plain subscriptions are destroyed
    /// instead.
    pub(crate) fn detach(&self) {
        let (timer, dispatch) = {
            let mut state = self.state();
            state.attached = false;
            (state.ack_timer.take(), state.ack_dispatch.take())
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(dispatch) = dispatch {
            dispatch.abort();
        }
    }

    /// Stop all background work for this subscription
    pub(crate) fn stop(&self) {
        self.detach();
    }

    /// Bind fresh inboxes and resume delivery on a durable
    pub(crate) fn rebind(&self, inbox: Subject, ack_inbox: Subject) {
        let mut state = self.state();
        state.inbox = inbox;
        state.ack_inbox = ack_inbox;
        state.attached = true;
    }

    /// The persistent image of this subscription
    pub(crate) fn record(&self) -> SubscriptionRecord {
        let state = self.state();
        SubscriptionRecord {
            id: self.id,
            client_id: self.client_id.clone(),
            channel: self.channel.clone(),
            inbox: state.inbox.clone(),
            ack_inbox: state.ack_inbox.clone(),
            durable_name: self.durable_name.clone(),
            queue_group: self.queue_group.clone(),
            ack_wait: self.ack_wait,
            max_in_flight: self.max_in_flight,
            last_sent: state.last_sent,
            is_detached: !state.attached,
        }
    }
}

/// Compute the initial `last_sent` for a new subscription
///
/// Durables only go through this on their first binding.
pub(crate) fn resolve_start(
    store: &dyn Store,
    channel: &ChannelName,
    request: &SubscriptionRequest,
    now_nanos: i64,
) -> Result<u64> {
    let last = store.last_sequence(channel)?;

    match request.start_position {
        StartPosition::NewOnly => Ok(last),
        StartPosition::LastReceived => {
            if last == 0 {
                return Err(ProtocolError::UnknownSequence.into());
            }
            Ok(last - 1)
        }
        StartPosition::First => Ok(store.first_sequence(channel)? - 1),
        StartPosition::SequenceStart => {
            let first = store.first_sequence(channel)?;
            let seq = request.start_sequence;
            if seq < first || seq > last {
                return Err(ProtocolError::UnknownSequence.into());
            }
            Ok(seq - 1)
        }
        StartPosition::TimeDeltaStart => {
            if last == 0 {
                return Err(ProtocolError::UnknownTimeDelta.into());
            }
            let cutoff = now_nanos.saturating_sub(request.start_time_delta_nanos);
            Ok(store.sequence_for_timestamp(channel, cutoff)? - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use cantaloupe_proto::{
        ChannelName, ProtocolError, StartPosition, SubscriptionRequest,
    };
    use claims::{assert_matches, assert_ok_eq};

    use crate::config::ChannelLimits;
    use crate::error::Error;
    use crate::store::{MemoryStore, Store};

    use super::resolve_start;

    fn request(start_position: StartPosition) -> SubscriptionRequest {
        SubscriptionRequest {
            start_position,
            ..SubscriptionRequest::default()
        }
    }

    fn store_with_msgs(count: usize) -> (MemoryStore, ChannelName) {
        let channel = ChannelName::from_static("foo");
        let store = MemoryStore::new(ChannelLimits::default());
        store.create_channel(&channel).unwrap();
        for ts in 0..count {
            store
                .store_msg(&channel, Bytes::from_static(b"m"), (ts as i64 + 1) * 100)
                .unwrap();
        }
        (store, channel)
    }

    #[test]
    fn new_only_points_at_the_tail() {
        let (store, channel) = store_with_msgs(3);
        assert_ok_eq!(
            resolve_start(&store, &channel, &request(StartPosition::NewOnly), 0),
            3
        );

        let (store, channel) = store_with_msgs(0);
        assert_ok_eq!(
            resolve_start(&store, &channel, &request(StartPosition::NewOnly), 0),
            0
        );
    }

    #[test]
    fn last_received_delivers_the_tail_message() {
        let (store, channel) = store_with_msgs(3);
        assert_ok_eq!(
            resolve_start(&store, &channel, &request(StartPosition::LastReceived), 0),
            2
        );

        let (store, channel) = store_with_msgs(0);
        let err =
            resolve_start(&store, &channel, &request(StartPosition::LastReceived), 0).unwrap_err();
        assert_matches!(err, Error::Protocol(ProtocolError::UnknownSequence));
    }

    #[test]
    fn first_delivers_everything() {
        let (store, channel) = store_with_msgs(3);
        assert_ok_eq!(
            resolve_start(&store, &channel, &request(StartPosition::First), 0),
            0
        );

        let (store, channel) = store_with_msgs(0);
        assert_ok_eq!(
            resolve_start(&store, &channel, &request(StartPosition::First), 0),
            0
        );
    }

    #[test]
    fn sequence_start_must_be_stored() {
        let (store, channel) = store_with_msgs(3);

        let mut req = request(StartPosition::SequenceStart);
        req.start_sequence = 2;
        assert_ok_eq!(resolve_start(&store, &channel, &req, 0), 1);

        req.start_sequence = 4;
        let err = resolve_start(&store, &channel, &req, 0).unwrap_err();
        assert_matches!(err, Error::Protocol(ProtocolError::UnknownSequence));

        req.start_sequence = 0;
        let err = resolve_start(&store, &channel, &req, 0).unwrap_err();
        assert_matches!(err, Error::Protocol(ProtocolError::UnknownSequence));
    }

    #[test]
    fn time_delta_finds_the_oldest_young_message() {
        let (store, channel) = store_with_msgs(3);

        // messages at 100, 200, 300; cutoff at 150 starts at seq 2
        let mut req = request(StartPosition::TimeDeltaStart);
        req.start_time_delta_nanos = 250;
        assert_ok_eq!(resolve_start(&store, &channel, &req, 400), 1);

        // a delta entirely in the past delivers everything
        req.start_time_delta_nanos = 1000;
        assert_ok_eq!(resolve_start(&store, &channel, &req, 400), 0);

        // a delta younger than every message delivers nothing yet
        req.start_time_delta_nanos = 50;
        assert_ok_eq!(resolve_start(&store, &channel, &req, 400), 3);
    }

    #[test]
    fn time_delta_on_empty_channel_fails() {
        let (store, channel) = store_with_msgs(0);

        let mut req = request(StartPosition::TimeDeltaStart);
        req.start_time_delta_nanos = 100;
        let err = resolve_start(&store, &channel, &req, 400).unwrap_err();
        assert_matches!(err, Error::Protocol(ProtocolError::UnknownTimeDelta));
    }

    #[test]
    fn subscription_ack_bookkeeping() {
        use std::time::Duration;

        use cantaloupe_proto::{ClientId, Subject};
        use tokio::time::Instant;

        use super::Subscription;

        let sub = Subscription::new(
            1,
            ClientId::from_static("me"),
            ChannelName::from_static("foo"),
            Subject::from_static("_INBOX.d"),
            Subject::from_static("_INBOX.a"),
            None,
            None,
            Duration::from_secs(30),
            1024,
            0,
        );

        {
            let mut state = sub.state();
            state.pending.insert(1, Instant::now());
            state.pending.insert(2, Instant::now());
            state.last_sent = 2;
        }

        assert!(sub.ack(1));
        assert!(!sub.ack(1));
        assert_eq!(1, sub.state().pending.len());
        assert!(sub.ack(2));
        assert!(sub.state().pending.is_empty());

        let record = sub.record();
        assert_eq!(2, record.last_sent);
        assert!(!record.is_detached);
    }
}
