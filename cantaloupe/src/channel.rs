use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use cantaloupe_proto::{ChannelName, ClientId, Subject};

use crate::error::Result;
use crate::store::Store;
use crate::sub::Subscription;

/// Runtime map of live channels
///
/// Channels are created lazily by the first publish or subscribe that
/// names them and never destroyed while the broker runs. Admission
/// against `max_channels` happens in the store, which owns the
/// persistent channel set.
#[derive(Debug, Default)]
pub(crate) struct ChannelMap {
    channels: Mutex<HashMap<ChannelName, Arc<Channel>>>,
}

/// One channel: a stored message log plus the directory of its
/// subscriptions
#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) name: ChannelName,
    pub(crate) subs: SubDirectory,
}

/// The three indexes a channel keeps over its subscriptions
///
/// Plain subscriptions (durables included, while attached) live in
/// `psubs`; durables are additionally keyed by client and durable
/// name; queue groups are first-class [`QueueState`] entries keyed by
/// group (and durable) name.
#[derive(Debug, Default)]
pub(crate) struct SubDirectory {
    inner: Mutex<DirInner>,
}

#[derive(Debug, Default)]
struct DirInner {
    psubs: Vec<Arc<Subscription>>,
    durables: HashMap<String, Arc<Subscription>>,
    qsubs: HashMap<String, Arc<QueueState>>,
}

/// Shared state of one queue group
///
/// Holds the group's delivery cursor and rotation index; members come
/// and go around it. The group itself is the identity the distributor
/// works with, not any single member.
#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) group: String,
    pub(crate) is_durable: bool,
    inner: Mutex<QueueInner>,
}

#[derive(Debug, Default)]
pub(crate) struct QueueInner {
    pub(crate) members: Vec<Arc<Subscription>>,
    /// Group cursor; never rewound
    pub(crate) last_sent: u64,
    pub(crate) next_member: usize,
    /// Sequences below the cursor owed a redelivery, after a member
    /// left with them in flight
    pub(crate) backlog: BTreeSet<u64>,
}

impl ChannelMap {
    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelName, Arc<Channel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, name: &ChannelName) -> Option<Arc<Channel>> {
        self.lock().get(name).map(Arc::clone)
    }

    /// Look up or lazily create a channel
    ///
    /// The store is consulted first so `max_channels` is enforced
    /// before any runtime state exists.
    pub(crate) fn get_or_create(
        &self,
        name: &ChannelName,
        store: &dyn Store,
    ) -> Result<Arc<Channel>> {
        if let Some(channel) = self.get(name) {
            return Ok(channel);
        }

        store.create_channel(name)?;

        let mut channels = self.lock();
        let channel = channels.entry(name.clone()).or_insert_with(|| {
            Arc::new(Channel {
                name: name.clone(),
                subs: SubDirectory::default(),
            })
        });
        Ok(Arc::clone(channel))
    }

    pub(crate) fn list(&self) -> Vec<Arc<Channel>> {
        self.lock().values().map(Arc::clone).collect()
    }

    pub(crate) fn names(&self) -> Vec<ChannelName> {
        let mut names = self.lock().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

pub(crate) fn durable_key(client_id: &ClientId, durable_name: &str) -> String {
    format!("{client_id}:{durable_name}")
}

pub(crate) fn queue_key(durable_name: Option<&str>, group: &str) -> String {
    match durable_name {
        Some(durable) => format!("{durable}:{group}"),
        None => group.to_owned(),
    }
}

impl SubDirectory {
    fn lock(&self) -> MutexGuard<'_, DirInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a non-durable plain subscription
    pub(crate) fn add_plain(&self, sub: &Arc<Subscription>) {
        self.lock().psubs.push(Arc::clone(sub));
    }

    /// Install a durable, unless its key is already taken
    pub(crate) fn try_insert_durable(&self, sub: &Arc<Subscription>) -> bool {
        let Some(durable_name) = &sub.durable_name else {
            return false;
        };

        let mut inner = self.lock();
        let key = durable_key(&sub.client_id, durable_name);
        if inner.durables.contains_key(&key) {
            return false;
        }
        inner.durables.insert(key, Arc::clone(sub));
        inner.psubs.push(Arc::clone(sub));
        true
    }

    /// Put a resumed durable back into the plain iteration list
    pub(crate) fn reattach_durable(&self, sub: &Arc<Subscription>) {
        let mut inner = self.lock();
        if !inner.psubs.iter().any(|existing| existing.id == sub.id) {
            inner.psubs.push(Arc::clone(sub));
        }
    }

    /// Take a detached durable out of the plain iteration list while
    /// keeping its durable slot
    pub(crate) fn detach_durable(&self, sub_id: u64) {
        self.lock().psubs.retain(|sub| sub.id != sub_id);
    }

    /// Remove a subscription from every index
    pub(crate) fn remove(&self, sub_id: u64) {
        let mut inner = self.lock();
        inner.psubs.retain(|sub| sub.id != sub_id);
        inner.durables.retain(|_, sub| sub.id != sub_id);
    }

    pub(crate) fn lookup_durable(&self, key: &str) -> Option<Arc<Subscription>> {
        self.lock().durables.get(key).map(Arc::clone)
    }

    pub(crate) fn plain_subs(&self) -> Vec<Arc<Subscription>> {
        self.lock().psubs.clone()
    }

    pub(crate) fn durable_count(&self) -> usize {
        self.lock().durables.len()
    }

    pub(crate) fn queue_states(&self) -> Vec<Arc<QueueState>> {
        self.lock().qsubs.values().map(Arc::clone).collect()
    }

    pub(crate) fn lookup_queue(&self, key: &str) -> Option<Arc<QueueState>> {
        self.lock().qsubs.get(key).map(Arc::clone)
    }

    pub(crate) fn get_or_create_queue(
        &self,
        key: &str,
        group: &str,
        is_durable: bool,
        last_sent: u64,
    ) -> Arc<QueueState> {
        let mut inner = self.lock();
        let queue = inner.qsubs.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(QueueState {
                group: group.to_owned(),
                is_durable,
                inner: Mutex::new(QueueInner {
                    last_sent,
                    ..QueueInner::default()
                }),
            })
        });
        Arc::clone(queue)
    }

    /// Drop a queue group once its last member is gone
    ///
    /// Durable groups outlive their members and are only removed this
    /// way when `force` is set (explicit unsubscribe of the last
    /// member).
    pub(crate) fn remove_queue_if_empty(&self, key: &str, force: bool) {
        let mut inner = self.lock();
        let Some(queue) = inner.qsubs.get(key) else {
            return;
        };
        if queue.lock().members.is_empty() && (force || !queue.is_durable) {
            inner.qsubs.remove(key);
        }
    }

    /// Find the subscription a request names by its ack inbox
    pub(crate) fn find_by_ack_inbox(&self, ack_inbox: &Subject) -> Option<Arc<Subscription>> {
        let inner = self.lock();

        let from_plain = inner
            .psubs
            .iter()
            .chain(inner.durables.values())
            .find(|sub| sub.state().ack_inbox == *ack_inbox);
        if let Some(sub) = from_plain {
            return Some(Arc::clone(sub));
        }

        for queue in inner.qsubs.values() {
            let members = queue.lock();
            if let Some(sub) = members
                .members
                .iter()
                .find(|sub| sub.state().ack_inbox == *ack_inbox)
            {
                return Some(Arc::clone(sub));
            }
        }

        None
    }
}

impl QueueState {
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_member(&self, sub: &Arc<Subscription>) {
        self.lock().members.push(Arc::clone(sub));
    }

    /// Remove a member, returning it together with the sequences it
    /// still had in flight
    pub(crate) fn remove_member(&self, sub_id: u64) -> Option<(Arc<Subscription>, Vec<u64>)> {
        let mut inner = self.lock();
        let position = inner.members.iter().position(|sub| sub.id == sub_id)?;
        let member = inner.members.remove(position);
        if inner.next_member > position {
            inner.next_member -= 1;
        }

        let pending = {
            let mut state = member.state();
            let pending = state.pending.keys().copied().collect::<Vec<_>>();
            state.pending.clear();
            pending
        };
        Some((member, pending))
    }

    pub(crate) fn member_count(&self) -> usize {
        self.lock().members.len()
    }
}
