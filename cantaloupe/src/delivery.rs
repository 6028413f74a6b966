use std::{sync::Arc, time::Duration};

use cantaloupe_proto::{encode, ChannelName, MsgProto, Subject};
use tokio::time::Instant;

use crate::bus::{Bus, BusMessage};
use crate::channel::{queue_key, Channel, QueueState};
use crate::store::{Store, StoredMessage};
use crate::sub::Subscription;

/// Grace added to the due check so a timer woken exactly at its
/// deadline sweeps the entry it woke for
const ACK_TIMER_FUDGE: Duration = Duration::from_millis(5);

/// Routes stored messages to eligible subscriptions
///
/// Owns the contract that every message published to a channel is
/// eventually delivered to every eligible attached subscription until
/// acknowledged or the subscription goes away. Cursor and in-flight
/// bookkeeping happen under the subscription (or queue) lock; store
/// and bus calls never do.
#[derive(Clone)]
pub(crate) struct DeliveryEngine {
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
}

enum QueuePick {
    Deliver {
        member: Arc<Subscription>,
        inbox: Subject,
        redelivered: bool,
    },
    /// The candidate went stale or pointed at an evicted message
    Skip,
    Done,
}

impl DeliveryEngine {
    pub(crate) fn new(bus: Arc<dyn Bus>, store: Arc<dyn Store>) -> Self {
        Self { bus, store }
    }

    /// Sweep every subscription of a channel after a publish
    pub(crate) async fn fan_out(&self, channel: &Arc<Channel>) {
        for sub in channel.subs.plain_subs() {
            self.send_available(&sub).await;
        }
        for queue in channel.subs.queue_states() {
            self.send_available_queue(&channel.name, &queue).await;
        }
    }

    /// Deliver as many stored messages as the subscription's window
    /// allows, advancing its cursor
    ///
    /// Safe to call concurrently for the same subscription; the state
    /// lock re-check keeps the cursor consistent.
    pub(crate) async fn send_available(&self, sub: &Arc<Subscription>) {
        loop {
            let next = {
                let state = sub.state();
                if !state.attached || state.pending.len() >= sub.max_in_flight {
                    return;
                }
                state.last_sent + 1
            };

            let last = match self.store.last_sequence(&sub.channel) {
                Ok(last) => last,
                Err(err) => {
                    tracing::warn!(channel = %sub.channel, %err, "store lookup failed");
                    return;
                }
            };
            if next > last {
                return;
            }

            let msg = match self.store.lookup_msg(&sub.channel, next) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::warn!(channel = %sub.channel, %err, "store lookup failed");
                    return;
                }
            };

            let inbox = {
                let mut state = sub.state();
                if !state.attached
                    || state.pending.len() >= sub.max_in_flight
                    || state.last_sent + 1 != next
                {
                    continue;
                }
                state.last_sent = next;

                match &msg {
                    // evicted from the log; the cursor moves past it
                    None => continue,
                    Some(_) => {
                        state.pending.insert(next, Instant::now());
                        state.inbox.clone()
                    }
                }
            };

            let msg = msg.expect("checked above");
            self.record_pending(&sub.channel, sub.id, next);
            self.publish_msg(&sub.channel, &inbox, &msg, false).await;
            self.ensure_ack_timer(sub);
        }
    }

    /// Distribute stored messages across a queue group's members
    ///
    /// Requeued sequences (from departed members) go out first, then
    /// the group cursor advances. If no member has window left the
    /// message waits.
    pub(crate) async fn send_available_queue(
        &self,
        channel: &ChannelName,
        queue: &Arc<QueueState>,
    ) {
        loop {
            let Some((seq, from_backlog)) = peek_queue_candidate(queue) else {
                return;
            };

            if !from_backlog {
                let last = match self.store.last_sequence(channel) {
                    Ok(last) => last,
                    Err(err) => {
                        tracing::warn!(%channel, %err, "store lookup failed");
                        return;
                    }
                };
                if seq > last {
                    return;
                }
            }

            let msg = match self.store.lookup_msg(channel, seq) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::warn!(%channel, %err, "store lookup failed");
                    return;
                }
            };

            match commit_queue_pick(queue, seq, from_backlog, msg.is_some()) {
                QueuePick::Deliver {
                    member,
                    inbox,
                    redelivered,
                } => {
                    let msg = msg.expect("a member was only picked for a stored message");
                    self.record_pending(channel, member.id, seq);
                    self.publish_msg(channel, &inbox, &msg, redelivered).await;
                    self.ensure_ack_timer(&member);
                }
                QueuePick::Skip => {}
                QueuePick::Done => return,
            }
        }
    }

    /// Process one ack: drop it from the in-flight set and pull the
    /// next eligible message
    pub(crate) async fn on_ack(&self, channel: &Arc<Channel>, sub: &Arc<Subscription>, seq: u64) {
        if !sub.ack(seq) {
            return;
        }

        if let Err(err) = self.store.ack_seq_pending(&sub.channel, sub.id, seq) {
            tracing::warn!(channel = %sub.channel, %err, "failed to persist ack");
        }

        match &sub.queue_group {
            Some(group) => {
                let key = queue_key(sub.durable_name.as_deref(), group);
                if let Some(queue) = channel.subs.lookup_queue(&key) {
                    self.send_available_queue(&channel.name, &queue).await;
                }
            }
            None => self.send_available(sub).await,
        }
    }

    /// Immediately re-send everything a resumed durable still has in
    /// flight, refreshing the redelivery clock
    pub(crate) async fn redeliver_pending(&self, sub: &Arc<Subscription>) {
        let (inbox, seqs) = {
            let mut state = sub.state();
            if !state.attached {
                return;
            }
            let now = Instant::now();
            let seqs = state.pending.keys().copied().collect::<Vec<_>>();
            for sent_at in state.pending.values_mut() {
                *sent_at = now;
            }
            (state.inbox.clone(), seqs)
        };

        for seq in seqs {
            match self.store.lookup_msg(&sub.channel, seq) {
                Ok(Some(msg)) => self.publish_msg(&sub.channel, &inbox, &msg, true).await,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(channel = %sub.channel, %err, "store lookup failed");
                }
            }
        }

        self.ensure_ack_timer(sub);
    }

    /// Hand the in-flight sequences of a departed member back to the
    /// group
    pub(crate) async fn requeue(
        &self,
        channel: &ChannelName,
        queue: &Arc<QueueState>,
        seqs: Vec<u64>,
    ) {
        if seqs.is_empty() {
            return;
        }

        queue.lock().backlog.extend(seqs);
        self.send_available_queue(channel, queue).await;
    }

    /// Arm the redelivery timer if in-flight data exists and it is
    /// not already running
    pub(crate) fn ensure_ack_timer(&self, sub: &Arc<Subscription>) {
        let mut state = sub.state();
        if state.ack_timer.is_some() || state.pending.is_empty() || !state.attached {
            return;
        }

        let engine = self.clone();
        let sub = Arc::clone(sub);
        let handle = tokio::spawn(async move {
            engine.ack_timer_loop(&sub).await;
        });
        state.ack_timer = Some(handle);
    }

    /// One subscription's redelivery loop
    ///
    /// Sleeps until the oldest in-flight entry is due, re-sends every
    /// due entry in ascending sequence order from the store, then
    /// reschedules for the minimum remaining wait. Exits (clearing
    /// its own handle) once the in-flight set drains.
    async fn ack_timer_loop(&self, sub: &Arc<Subscription>) {
        loop {
            let deadline = {
                let mut state = sub.state();
                let Some(oldest) = state.pending.values().min().copied() else {
                    state.ack_timer = None;
                    return;
                };
                if !state.attached {
                    state.ack_timer = None;
                    return;
                }
                oldest + sub.ack_wait
            };

            tokio::time::sleep_until(deadline).await;

            let (inbox, due) = {
                let mut state = sub.state();
                if !state.attached {
                    state.ack_timer = None;
                    return;
                }
                let now = Instant::now();
                let due = state
                    .pending
                    .iter()
                    .filter(|(_, sent_at)| **sent_at + sub.ack_wait <= now + ACK_TIMER_FUDGE)
                    .map(|(seq, _)| *seq)
                    .collect::<Vec<_>>();
                for seq in &due {
                    state.pending.insert(*seq, now);
                }
                (state.inbox.clone(), due)
            };

            for seq in due {
                match self.store.lookup_msg(&sub.channel, seq) {
                    Ok(Some(msg)) => self.publish_msg(&sub.channel, &inbox, &msg, true).await,
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(channel = %sub.channel, %err, "store lookup failed");
                    }
                }
            }
        }
    }

    fn record_pending(&self, channel: &ChannelName, sub_id: u64, seq: u64) {
        if let Err(err) = self.store.add_seq_pending(channel, sub_id, seq) {
            tracing::warn!(%channel, %err, "failed to persist pending sequence");
        }
    }

    async fn publish_msg(
        &self,
        channel: &ChannelName,
        inbox: &Subject,
        msg: &StoredMessage,
        redelivered: bool,
    ) {
        let proto = MsgProto {
            channel: channel.clone(),
            sequence: msg.sequence,
            payload: msg.payload.clone(),
            timestamp_nanos: msg.timestamp_nanos,
            redelivered,
        };

        let publish = self.bus.publish(BusMessage {
            subject: inbox.clone(),
            reply: None,
            payload: encode(&proto),
        });
        if let Err(err) = publish.await {
            // the ack timer re-sends; transient bus failures only cost latency
            tracing::warn!(%channel, sequence = msg.sequence, %err, "delivery failed");
        }
    }
}

fn peek_queue_candidate(queue: &Arc<QueueState>) -> Option<(u64, bool)> {
    let q = queue.lock();
    let has_window = q
        .members
        .iter()
        .any(|member| member.state().pending.len() < member.max_in_flight);
    if !has_window {
        return None;
    }

    match q.backlog.iter().next() {
        Some(&seq) => Some((seq, true)),
        None => Some((q.last_sent + 1, false)),
    }
}

fn commit_queue_pick(
    queue: &Arc<QueueState>,
    seq: u64,
    from_backlog: bool,
    msg_found: bool,
) -> QueuePick {
    let mut q = queue.lock();

    // the candidate may have gone stale between peek and commit
    if from_backlog {
        if !q.backlog.remove(&seq) {
            return QueuePick::Skip;
        }
        if !msg_found {
            // evicted while waiting; nothing left to redeliver
            return QueuePick::Skip;
        }
    } else {
        if q.last_sent + 1 != seq {
            return QueuePick::Skip;
        }
        if !msg_found {
            q.last_sent = seq;
            return QueuePick::Skip;
        }
    }

    let count = q.members.len();
    for offset in 0..count {
        let index = (q.next_member + offset) % count;
        let member = &q.members[index];

        let mut state = member.state();
        if state.pending.len() >= member.max_in_flight {
            continue;
        }
        state.pending.insert(seq, Instant::now());
        if state.last_sent < seq {
            state.last_sent = seq;
        }
        let inbox = state.inbox.clone();
        drop(state);

        let member = Arc::clone(member);
        q.next_member = (index + 1) % count;
        if !from_backlog {
            q.last_sent = seq;
        }
        return QueuePick::Deliver {
            member,
            inbox,
            redelivered: from_backlog,
        };
    }

    // every member is at its window; put the candidate back and wait
    if from_backlog {
        q.backlog.insert(seq);
    }
    QueuePick::Done
}
