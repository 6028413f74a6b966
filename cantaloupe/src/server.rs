use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use cantaloupe_proto::{
    decode, encode, Ack, ChannelName, ClientId, CloseRequest, CloseResponse, ConnectRequest,
    ConnectResponse, ProtocolError, PubAck, PubMsg, Subject, SubscriptionRequest,
    SubscriptionResponse, UnsubscribeRequest,
};
use chrono::Utc;
use futures_util::StreamExt as _;
use serde::Serialize;
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};

use crate::bus::{create_inbox_subject, Bus, BusMessage};
use crate::channel::{durable_key, queue_key, Channel, ChannelMap};
use crate::config::{BrokerOptions, StoreKind};
use crate::delivery::DeliveryEngine;
use crate::error::{Error, Result};
use crate::registry::{Client, ClientRegistry};
use crate::store::{ClientRecord, FileStore, MemoryStore, RecoveredState, Store};
use crate::sub::{resolve_start, Subscription};

/// A streaming broker bound to a message bus
///
/// `Broker` is a `Clone`able handle. Start it with [`Broker::start`];
/// it then serves connect, publish, subscribe, unsubscribe, close and
/// ack traffic on its control subjects until [`Broker::shutdown`].
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    options: BrokerOptions,
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
    clients: ClientRegistry,
    channels: ChannelMap,
    engine: DeliveryEngine,
    subjects: ControlSubjects,
    next_sub_id: AtomicU64,
    dup_cid_slots: Semaphore,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The well-known subjects one broker instance answers on
#[derive(Debug, Clone)]
struct ControlSubjects {
    discover: Subject,
    pub_prefix: Subject,
    sub_requests: Subject,
    unsub_requests: Subject,
    close_requests: Subject,
}

#[derive(Debug, Copy, Clone)]
enum Endpoint {
    Connect,
    Publish,
    Subscribe,
    Unsubscribe,
    Close,
}

/// Point-in-time view of one subscription, for monitoring and tests
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub client_id: ClientId,
    pub durable_name: Option<String>,
    pub queue_group: Option<String>,
    pub last_sent: u64,
    pub pending: Vec<u64>,
    pub ack_timer_active: bool,
    pub attached: bool,
}

/// Point-in-time view of one queue group
#[derive(Debug, Clone)]
pub struct QueueGroupSnapshot {
    pub group: String,
    pub members: usize,
    pub last_sent: u64,
}

/// Point-in-time view of one channel
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub name: ChannelName,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub plain_subs: usize,
    pub durables: usize,
    pub queue_groups: Vec<QueueGroupSnapshot>,
}

impl Broker {
    /// Construct options for [`Broker::start`]
    #[must_use]
    pub fn options() -> BrokerOptions {
        BrokerOptions::new()
    }

    /// Start a broker on the given bus
    ///
    /// Opens the configured store, recovers any persisted state,
    /// binds the control subjects and spawns the heartbeat loop.
    ///
    /// # Errors
    ///
    /// It returns an error on invalid configuration, an unusable
    /// store directory, a cluster id mismatch on recovery, or a bus
    /// failure while binding the control subjects.
    pub async fn start(options: BrokerOptions, bus: Arc<dyn Bus>) -> Result<Self> {
        validate_cluster_id(&options.cluster_id)?;

        let store: Arc<dyn Store> = match options.store {
            StoreKind::Memory => Arc::new(MemoryStore::new(options.limits)),
            StoreKind::File => {
                let dir = options.store_dir.as_deref().ok_or(Error::MissingStoreDir)?;
                Arc::new(FileStore::open(dir, &options.cluster_id, options.limits)?)
            }
        };
        let recovered = store.recover()?;

        let discover = Subject::from_dangerous_value(
            format!("{}.{}", options.discover_prefix, options.cluster_id).into(),
        );
        let subjects = ControlSubjects {
            discover,
            pub_prefix: create_inbox_subject("_CLP.pub"),
            sub_requests: create_inbox_subject("_CLP.sub"),
            unsub_requests: create_inbox_subject("_CLP.unsub"),
            close_requests: create_inbox_subject("_CLP.close"),
        };

        let inner = Arc::new(BrokerInner {
            engine: DeliveryEngine::new(Arc::clone(&bus), Arc::clone(&store)),
            dup_cid_slots: Semaphore::new(options.dup_max_cid_routines),
            options,
            bus,
            store,
            clients: ClientRegistry::default(),
            channels: ChannelMap::default(),
            subjects,
            next_sub_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        if let Some(state) = recovered {
            inner.restore(state).await?;
        }
        inner.start_dispatchers().await?;
        inner.start_heartbeat_loop();

        tracing::info!(
            cluster_id = %inner.options.cluster_id,
            discover = %inner.subjects.discover,
            "broker started",
        );
        Ok(Self { inner })
    }

    /// Subject clients send their connect requests to
    #[must_use]
    pub fn discover_subject(&self) -> Subject {
        self.inner.subjects.discover.clone()
    }

    /// Ids of currently registered clients, sorted
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner.clients.ids()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.count()
    }

    /// Names of currently live channels, sorted
    #[must_use]
    pub fn channel_names(&self) -> Vec<ChannelName> {
        self.inner.channels.names()
    }

    /// Inspect one channel
    #[must_use]
    pub fn channel_snapshot(&self, name: &ChannelName) -> Option<ChannelSnapshot> {
        let channel = self.inner.channels.get(name)?;

        let mut queue_groups = channel
            .subs
            .queue_states()
            .iter()
            .map(|queue| {
                let inner = queue.lock();
                QueueGroupSnapshot {
                    group: queue.group.clone(),
                    members: inner.members.len(),
                    last_sent: inner.last_sent,
                }
            })
            .collect::<Vec<_>>();
        queue_groups.sort_by(|a, b| a.group.cmp(&b.group));

        Some(ChannelSnapshot {
            name: name.clone(),
            first_sequence: self.inner.store.first_sequence(name).ok()?,
            last_sequence: self.inner.store.last_sequence(name).ok()?,
            plain_subs: channel.subs.plain_subs().len(),
            durables: channel.subs.durable_count(),
            queue_groups,
        })
    }

    /// Inspect the subscription a given ack inbox belongs to
    #[must_use]
    pub fn subscription_snapshot(
        &self,
        channel: &ChannelName,
        ack_inbox: &Subject,
    ) -> Option<SubscriptionSnapshot> {
        let channel = self.inner.channels.get(channel)?;
        let sub = channel.subs.find_by_ack_inbox(ack_inbox)?;
        Some(snapshot_sub(&sub))
    }

    /// Inspect a durable subscription by its identity, attached or not
    #[must_use]
    pub fn durable_snapshot(
        &self,
        channel: &ChannelName,
        client_id: &ClientId,
        durable_name: &str,
    ) -> Option<SubscriptionSnapshot> {
        let channel = self.inner.channels.get(channel)?;
        let sub = channel
            .subs
            .lookup_durable(&durable_key(client_id, durable_name))?;
        Some(snapshot_sub(&sub))
    }

    /// Stop serving and release resources
    ///
    /// Idempotent: the second and every further call return
    /// immediately. In-flight handlers observe the flag and stop
    /// without further mutation.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }

        for channel in self.inner.channels.list() {
            for sub in channel.subs.plain_subs() {
                sub.stop();
            }
            for queue in channel.subs.queue_states() {
                let members = queue.lock().members.clone();
                for member in members {
                    member.stop();
                }
            }
        }

        if let Err(err) = self.inner.store.close() {
            tracing::warn!(%err, "failed to close store");
        }
        tracing::info!("broker shut down");
    }
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

impl BrokerInner {
    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn next_sub_id(&self) -> u64 {
        self.next_sub_id.fetch_add(1, Ordering::AcqRel)
    }

    async fn start_dispatchers(self: &Arc<Self>) -> Result<()> {
        let publish_filter = Subject::from_dangerous_value(
            format!("{}.>", self.subjects.pub_prefix).into(),
        );
        let endpoints = [
            (self.subjects.discover.clone(), Endpoint::Connect),
            (publish_filter, Endpoint::Publish),
            (self.subjects.sub_requests.clone(), Endpoint::Subscribe),
            (self.subjects.unsub_requests.clone(), Endpoint::Unsubscribe),
            (self.subjects.close_requests.clone(), Endpoint::Close),
        ];

        for (filter, endpoint) in endpoints {
            let mut bus_sub = self.bus.subscribe(filter).await?;
            let weak = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                while let Some(msg) = bus_sub.next().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    if inner.is_shutdown() {
                        break;
                    }

                    // handlers are reentrant; only publishes stay on
                    // this loop so a channel's sequences follow its
                    // publish order
                    match endpoint {
                        Endpoint::Publish => inner.dispatch(endpoint, msg).await,
                        _ => {
                            tokio::spawn(async move {
                                inner.dispatch(endpoint, msg).await;
                            });
                        }
                    }
                }
            });
            self.lock_tasks().push(task);
        }

        Ok(())
    }

    fn start_heartbeat_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let hb_interval = self.options.hb_interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval(hb_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_shutdown() {
                    break;
                }

                for client in inner.clients.list() {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        inner.check_heartbeat(client).await;
                    });
                }
            }
        });
        self.lock_tasks().push(task);
    }

    async fn check_heartbeat(self: &Arc<Self>, client: Arc<Client>) {
        if self.is_shutdown() {
            return;
        }

        let probe = self
            .bus
            .request(client.hb_inbox.clone(), Bytes::new(), self.options.hb_timeout)
            .await;
        match probe {
            Ok(_) => client.heartbeat_ok(),
            Err(_) => {
                let failed = client.heartbeat_missed();
                if failed >= self.options.max_failed_heartbeats {
                    tracing::info!(client_id = %client.id, failed, "purging unresponsive client");
                    self.close_client(&client.id).await;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, endpoint: Endpoint, msg: BusMessage) {
        match endpoint {
            Endpoint::Connect => self.handle_connect(msg).await,
            Endpoint::Publish => self.handle_publish(msg).await,
            Endpoint::Subscribe => self.handle_subscribe(msg).await,
            Endpoint::Unsubscribe => self.handle_unsubscribe(msg).await,
            Endpoint::Close => self.handle_close(msg).await,
        }
    }

    async fn respond<T: Serialize>(&self, reply: &Subject, value: &T) {
        let publish = self.bus.publish(BusMessage {
            subject: reply.clone(),
            reply: None,
            payload: encode(value),
        });
        if let Err(err) = publish.await {
            tracing::warn!(%err, "failed to publish reply");
        }
    }

    async fn handle_connect(self: &Arc<Self>, msg: BusMessage) {
        let Some(reply) = msg.reply else {
            return;
        };

        let response = match self.connect_inner(&msg.payload).await {
            Ok(response) => response,
            Err(err) => ConnectResponse {
                error: error_string(&err),
                ..ConnectResponse::default()
            },
        };
        self.respond(&reply, &response).await;
    }

    async fn connect_inner(self: &Arc<Self>, payload: &[u8]) -> Result<ConnectResponse> {
        let request: ConnectRequest =
            decode(payload).map_err(|_| ProtocolError::InvalidConnectRequest)?;
        if request.client_id.is_empty() || request.heartbeat_inbox.is_empty() {
            return Err(ProtocolError::InvalidConnectRequest.into());
        }
        let hb_inbox = Subject::try_from(request.heartbeat_inbox)
            .map_err(|_| ProtocolError::InvalidConnectRequest)?;
        let client_id = ClientId::try_from(request.client_id)
            .map_err(|_| ProtocolError::InvalidClientId)?;

        if self
            .clients
            .register(client_id.clone(), hb_inbox.clone())
            .is_err()
        {
            self.arbitrate_duplicate(&client_id, &hb_inbox).await?;
        }

        if let Err(err) = self.store.add_client(&ClientRecord {
            id: client_id.clone(),
            hb_inbox,
        }) {
            self.clients.unregister(&client_id);
            return Err(err);
        }

        tracing::debug!(%client_id, "client connected");
        Ok(ConnectResponse {
            pub_prefix: Some(self.subjects.pub_prefix.clone()),
            sub_requests: Some(self.subjects.sub_requests.clone()),
            unsub_requests: Some(self.subjects.unsub_requests.clone()),
            close_requests: Some(self.subjects.close_requests.clone()),
            error: String::new(),
        })
    }

    /// Decide whether an already registered client id may be taken
    /// over, and take it over if so
    ///
    /// A bounded number of these arbitrations run in parallel; the
    /// rest wait for a slot. The existing client gets one synchronous
    /// heartbeat probe: a reply keeps its registration, a timeout
    /// purges it and admits the new connect. The slot is held until
    /// the replacement is registered, so queued arbitrations always
    /// observe a settled registry.
    async fn arbitrate_duplicate(
        self: &Arc<Self>,
        client_id: &ClientId,
        hb_inbox: &Subject,
    ) -> Result<()> {
        let _permit = self
            .dup_cid_slots
            .acquire()
            .await
            .map_err(|_| Error::Shutdown)?;

        // the holder may have gone away while this request waited
        if let Some(current) = self.clients.lookup(client_id) {
            let probe = self
                .bus
                .request(
                    current.hb_inbox.clone(),
                    Bytes::new(),
                    self.options.dup_cid_timeout,
                )
                .await;
            if probe.is_ok() {
                return Err(ProtocolError::ClientIdAlreadyRegistered.into());
            }

            tracing::info!(%client_id, "replacing silent duplicate client");
            self.close_client(client_id).await;
        }

        self.clients
            .register(client_id.clone(), hb_inbox.clone())
            .map_err(|_| ProtocolError::ClientIdAlreadyRegistered)?;
        Ok(())
    }

    async fn handle_publish(self: &Arc<Self>, msg: BusMessage) {
        let request = match decode::<PubMsg>(&msg.payload) {
            Ok(request) => request,
            Err(_) => {
                if let Some(reply) = &msg.reply {
                    let response = PubAck {
                        guid: String::new(),
                        error: ProtocolError::InvalidPublishRequest.to_string(),
                    };
                    self.respond(reply, &response).await;
                }
                return;
            }
        };

        let guid = request.guid.clone();
        let response = match self.publish_inner(request).await {
            Ok(()) => PubAck {
                guid,
                error: String::new(),
            },
            Err(err) => PubAck {
                guid,
                error: error_string(&err),
            },
        };
        if let Some(reply) = &msg.reply {
            self.respond(reply, &response).await;
        }
    }

    async fn publish_inner(self: &Arc<Self>, request: PubMsg) -> Result<()> {
        if request.channel.is_empty() || request.payload.is_empty() {
            return Err(ProtocolError::InvalidPublishRequest.into());
        }
        let name = ChannelName::try_from(request.channel)
            .map_err(|_| ProtocolError::InvalidChannel)?;

        let channel = self.channels.get_or_create(&name, self.store.as_ref())?;
        self.store
            .store_msg(&name, request.payload, now_nanos())?;
        self.engine.fan_out(&channel).await;
        Ok(())
    }

    async fn handle_subscribe(self: &Arc<Self>, msg: BusMessage) {
        let Some(reply) = msg.reply else {
            return;
        };

        let response = match self.subscribe_inner(&msg.payload).await {
            Ok(ack_inbox) => SubscriptionResponse {
                ack_inbox: Some(ack_inbox),
                error: String::new(),
            },
            Err(err) => SubscriptionResponse {
                ack_inbox: None,
                error: error_string(&err),
            },
        };
        self.respond(&reply, &response).await;
    }

    async fn subscribe_inner(self: &Arc<Self>, payload: &[u8]) -> Result<Subject> {
        let request: SubscriptionRequest =
            decode(payload).map_err(|_| ProtocolError::InvalidSubscriptionRequest)?;

        let name = ChannelName::try_from(request.channel.clone())
            .map_err(|_| ProtocolError::InvalidChannel)?;
        if request.ack_wait_secs <= 0 || request.max_in_flight <= 0 {
            return Err(ProtocolError::InvalidSubscriptionRequest.into());
        }
        let client_id = ClientId::try_from(request.client_id.clone())
            .map_err(|_| ProtocolError::InvalidClientId)?;
        let client = self
            .clients
            .lookup(&client_id)
            .ok_or(ProtocolError::UnknownClientId)?;

        // durable and queue names become store and directory keys
        if request.durable_name.contains(':') || request.q_group.contains(':') {
            return Err(ProtocolError::InvalidSubscriptionRequest.into());
        }
        let inbox = Subject::try_from(request.inbox.clone())
            .map_err(|_| ProtocolError::InvalidSubscriptionRequest)?;

        let channel = self.channels.get_or_create(&name, self.store.as_ref())?;

        if !request.q_group.is_empty() {
            self.subscribe_queue(&channel, &client, &request, inbox).await
        } else if !request.durable_name.is_empty() {
            self.subscribe_durable(&channel, &client, &request, inbox)
                .await
        } else {
            self.subscribe_plain(&channel, &client, &request, inbox, None)
                .await
        }
    }

    /// Install a brand new non-queue subscription
    async fn subscribe_plain(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        client: &Arc<Client>,
        request: &SubscriptionRequest,
        inbox: Subject,
        durable_name: Option<String>,
    ) -> Result<Subject> {
        let last_sent = resolve_start(self.store.as_ref(), &channel.name, request, now_nanos())?;
        let ack_inbox = self.bus.new_inbox();

        let sub = Arc::new(Subscription::new(
            self.next_sub_id(),
            client.id.clone(),
            channel.name.clone(),
            inbox,
            ack_inbox.clone(),
            durable_name,
            None,
            ack_wait(request),
            max_in_flight(request),
            last_sent,
        ));
        self.store.create_sub(&sub.record())?;

        if sub.is_durable() {
            if !channel.subs.try_insert_durable(&sub) {
                // a concurrent subscribe with the same durable won
                if let Err(err) = self.store.delete_sub(&channel.name, sub.id) {
                    tracing::warn!(%err, "failed to delete subscription record");
                }
                return Err(ProtocolError::InvalidSubscriptionRequest.into());
            }
        } else {
            channel.subs.add_plain(&sub);
        }
        client.add_sub(Arc::clone(&sub));
        self.start_ack_dispatch(channel, &sub).await?;

        self.engine.send_available(&sub).await;
        Ok(ack_inbox)
    }

    /// Create or resume a durable subscription
    async fn subscribe_durable(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        client: &Arc<Client>,
        request: &SubscriptionRequest,
        inbox: Subject,
    ) -> Result<Subject> {
        let key = durable_key(&client.id, &request.durable_name);
        let Some(existing) = channel.subs.lookup_durable(&key) else {
            return self
                .subscribe_plain(
                    channel,
                    client,
                    request,
                    inbox,
                    Some(request.durable_name.clone()),
                )
                .await;
        };

        if existing.state().attached {
            // the durable is already running; this is a duplicate
            return Err(ProtocolError::InvalidSubscriptionRequest.into());
        }

        // resume: bind fresh inboxes and pick up at the stored cursor,
        // ignoring the requested start position
        let ack_inbox = self.bus.new_inbox();
        existing.rebind(inbox, ack_inbox.clone());
        channel.subs.reattach_durable(&existing);
        client.add_sub(Arc::clone(&existing));
        self.store.update_sub(&existing.record())?;
        self.start_ack_dispatch(channel, &existing).await?;

        tracing::debug!(
            client_id = %client.id,
            durable = request.durable_name,
            "durable resumed",
        );
        self.engine.redeliver_pending(&existing).await;
        self.engine.send_available(&existing).await;
        Ok(ack_inbox)
    }

    /// Join or create a queue group
    async fn subscribe_queue(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        client: &Arc<Client>,
        request: &SubscriptionRequest,
        inbox: Subject,
    ) -> Result<Subject> {
        let durable_name = (!request.durable_name.is_empty())
            .then(|| request.durable_name.clone());
        let key = queue_key(durable_name.as_deref(), &request.q_group);

        let queue = match channel.subs.lookup_queue(&key) {
            Some(queue) => queue,
            None => {
                // the start position only applies to a brand new group
                let last_sent =
                    resolve_start(self.store.as_ref(), &channel.name, request, now_nanos())?;
                channel.subs.get_or_create_queue(
                    &key,
                    &request.q_group,
                    durable_name.is_some(),
                    last_sent,
                )
            }
        };

        let ack_inbox = self.bus.new_inbox();
        let sub = Arc::new(Subscription::new(
            self.next_sub_id(),
            client.id.clone(),
            channel.name.clone(),
            inbox,
            ack_inbox.clone(),
            durable_name,
            Some(request.q_group.clone()),
            ack_wait(request),
            max_in_flight(request),
            queue.lock().last_sent,
        ));
        if let Err(err) = self.store.create_sub(&sub.record()) {
            channel.subs.remove_queue_if_empty(&key, true);
            return Err(err);
        }

        queue.add_member(&sub);
        client.add_sub(Arc::clone(&sub));
        self.start_ack_dispatch(channel, &sub).await?;

        self.engine.send_available_queue(&channel.name, &queue).await;
        Ok(ack_inbox)
    }

    async fn handle_unsubscribe(self: &Arc<Self>, msg: BusMessage) {
        let Some(reply) = msg.reply else {
            return;
        };

        let response = match self.unsubscribe_inner(&msg.payload).await {
            Ok(()) => SubscriptionResponse::default(),
            Err(err) => SubscriptionResponse {
                ack_inbox: None,
                error: error_string(&err),
            },
        };
        self.respond(&reply, &response).await;
    }

    async fn unsubscribe_inner(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let request: UnsubscribeRequest =
            decode(payload).map_err(|_| ProtocolError::InvalidUnsubscribeRequest)?;

        let client_id = ClientId::try_from(request.client_id)
            .map_err(|_| ProtocolError::InvalidClientId)?;
        let client = self
            .clients
            .lookup(&client_id)
            .ok_or(ProtocolError::UnknownClientId)?;
        let name = ChannelName::try_from(request.channel)
            .map_err(|_| ProtocolError::InvalidChannel)?;
        let ack_inbox = Subject::try_from(request.ack_inbox)
            .map_err(|_| ProtocolError::InvalidUnsubscribeRequest)?;

        let channel = self
            .channels
            .get(&name)
            .ok_or(ProtocolError::InvalidUnsubscribeRequest)?;
        let sub = channel
            .subs
            .find_by_ack_inbox(&ack_inbox)
            .ok_or(ProtocolError::InvalidUnsubscribeRequest)?;
        if sub.client_id != client_id {
            return Err(ProtocolError::NotOwnedByClient.into());
        }

        // explicit unsubscribe is the one destructor durables have
        self.remove_subscription(&channel, &sub, true).await;
        client.remove_sub(sub.id);
        tracing::debug!(%client_id, channel = %name, "unsubscribed");
        Ok(())
    }

    async fn handle_close(self: &Arc<Self>, msg: BusMessage) {
        let Some(reply) = msg.reply else {
            return;
        };

        let response = match self.close_inner(&msg.payload).await {
            Ok(()) => CloseResponse::default(),
            Err(err) => CloseResponse {
                error: error_string(&err),
            },
        };
        self.respond(&reply, &response).await;
    }

    async fn close_inner(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let request: CloseRequest =
            decode(payload).map_err(|_| ProtocolError::InvalidCloseRequest)?;
        let client_id = ClientId::try_from(request.client_id)
            .map_err(|_| ProtocolError::InvalidClientId)?;

        if !self.close_client(&client_id).await {
            return Err(ProtocolError::UnknownClientId.into());
        }
        Ok(())
    }

    /// Remove a client and tear down everything it owns
    ///
    /// Shared by explicit close, heartbeat purge and duplicate-id
    /// takeover. Durable subscriptions are detached, everything else
    /// is destroyed.
    async fn close_client(self: &Arc<Self>, client_id: &ClientId) -> bool {
        let Some(client) = self.clients.unregister(client_id) else {
            return false;
        };

        for sub in client.subs() {
            let Some(channel) = self.channels.get(&sub.channel) else {
                continue;
            };

            if sub.is_durable() && sub.queue_group.is_none() {
                sub.detach();
                channel.subs.detach_durable(sub.id);
                if let Err(err) = self.store.update_sub(&sub.record()) {
                    tracing::warn!(%err, "failed to persist durable detach");
                }
            } else {
                self.remove_subscription(&channel, &sub, false).await;
            }
        }

        if let Err(err) = self.store.delete_client(client_id) {
            tracing::warn!(%err, "failed to delete client record");
        }
        tracing::debug!(%client_id, "client closed");
        true
    }

    /// Destroy one subscription, requeueing any in-flight sequences
    /// it held for its queue group
    ///
    /// `unsubscribe` marks the explicit path, which is also allowed
    /// to destroy a durable queue group once its last member leaves.
    async fn remove_subscription(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        sub: &Arc<Subscription>,
        unsubscribe: bool,
    ) {
        sub.stop();

        if let Some(group) = &sub.queue_group {
            let key = queue_key(sub.durable_name.as_deref(), group);
            if let Some(queue) = channel.subs.lookup_queue(&key) {
                if let Some((_, pending)) = queue.remove_member(sub.id) {
                    self.engine.requeue(&channel.name, &queue, pending).await;
                }
                channel.subs.remove_queue_if_empty(&key, unsubscribe);
            }
        } else {
            channel.subs.remove(sub.id);
        }

        if let Err(err) = self.store.delete_sub(&channel.name, sub.id) {
            tracing::warn!(%err, "failed to delete subscription record");
        }
    }

    /// Bind a subscription's ack inbox on the bus and drain it
    async fn start_ack_dispatch(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        sub: &Arc<Subscription>,
    ) -> Result<()> {
        let mut bus_sub = self.bus.subscribe(sub.ack_inbox()).await?;

        let engine = self.engine.clone();
        let channel = Arc::clone(channel);
        let ack_sub = Arc::clone(sub);
        let task = tokio::spawn(async move {
            while let Some(msg) = bus_sub.next().await {
                let Ok(ack) = decode::<Ack>(&msg.payload) else {
                    tracing::debug!("ignoring malformed ack");
                    continue;
                };
                engine.on_ack(&channel, &ack_sub, ack.sequence).await;
            }
        });
        sub.state().ack_dispatch = Some(task);
        Ok(())
    }

    /// Rebuild runtime state reported by the store
    async fn restore(self: &Arc<Self>, state: RecoveredState) -> Result<()> {
        for record in &state.clients {
            if self
                .clients
                .register(record.id.clone(), record.hb_inbox.clone())
                .is_err()
            {
                tracing::warn!(client_id = %record.id, "duplicate client in recovered state");
            }
        }

        let mut dropped = 0_usize;
        for recovered_channel in state.channels {
            let channel = self
                .channels
                .get_or_create(&recovered_channel.name, self.store.as_ref())?;

            for recovered in recovered_channel.subscriptions {
                let record = recovered.record;
                let Some(client) = self.clients.lookup(&record.client_id) else {
                    // the owner did not survive; the channel does
                    self.store.delete_sub(&channel.name, record.id)?;
                    dropped += 1;
                    continue;
                };

                self.next_sub_id
                    .fetch_max(record.id + 1, Ordering::AcqRel);

                let sub = Arc::new(Subscription::new(
                    record.id,
                    record.client_id.clone(),
                    record.channel.clone(),
                    record.inbox.clone(),
                    record.ack_inbox.clone(),
                    record.durable_name.clone(),
                    record.queue_group.clone(),
                    record.ack_wait,
                    record.max_in_flight,
                    record.last_sent,
                ));
                {
                    let mut sub_state = sub.state();
                    let now = Instant::now();
                    for seq in recovered.pending {
                        sub_state.pending.insert(seq, now);
                    }
                    sub_state.attached = !record.is_detached;
                }

                match &record.queue_group {
                    Some(group) => {
                        let key = queue_key(record.durable_name.as_deref(), group);
                        let queue = channel.subs.get_or_create_queue(
                            &key,
                            group,
                            record.durable_name.is_some(),
                            record.last_sent,
                        );
                        {
                            let mut q = queue.lock();
                            q.last_sent = q.last_sent.max(record.last_sent);
                        }
                        queue.add_member(&sub);
                    }
                    None => {
                        if sub.is_durable() {
                            channel.subs.try_insert_durable(&sub);
                        } else {
                            channel.subs.add_plain(&sub);
                        }
                        if record.is_detached {
                            channel.subs.detach_durable(sub.id);
                        }
                    }
                }
                client.add_sub(Arc::clone(&sub));

                if !record.is_detached {
                    self.start_ack_dispatch(&channel, &sub).await?;
                    // recovered in-flight entries wait for the timer,
                    // they are not re-sent eagerly
                    self.engine.ensure_ack_timer(&sub);
                }
            }
        }

        tracing::info!(
            clients = self.clients.count(),
            channels = self.channels.names().len(),
            dropped_subs = dropped,
            "recovery complete",
        );
        Ok(())
    }
}

fn snapshot_sub(sub: &Arc<Subscription>) -> SubscriptionSnapshot {
    let state = sub.state();
    SubscriptionSnapshot {
        client_id: sub.client_id.clone(),
        durable_name: sub.durable_name.clone(),
        queue_group: sub.queue_group.clone(),
        last_sent: state.last_sent,
        pending: state.pending.keys().copied().collect(),
        ack_timer_active: state.ack_timer.is_some(),
        attached: state.attached,
    }
}

fn ack_wait(request: &SubscriptionRequest) -> Duration {
    Duration::from_secs(u64::try_from(request.ack_wait_secs).unwrap_or_default())
}

fn max_in_flight(request: &SubscriptionRequest) -> usize {
    usize::try_from(request.max_in_flight).unwrap_or_default()
}

fn error_string(err: &Error) -> String {
    match err {
        Error::Protocol(protocol_err) => protocol_err.to_string(),
        other => other.to_string(),
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn validate_cluster_id(cluster_id: &str) -> Result<()> {
    let valid = !cluster_id.is_empty()
        && cluster_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidClusterId(cluster_id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_matches, assert_ok};

    use crate::error::Error;

    use super::validate_cluster_id;

    #[test]
    fn cluster_ids_follow_the_client_id_alphabet() {
        assert_ok!(validate_cluster_id("my-cluster_01"));
        assert_matches!(validate_cluster_id(""), Err(Error::InvalidClusterId(_)));
        assert_matches!(
            validate_cluster_id("my.cluster"),
            Err(Error::InvalidClusterId(_))
        );
        assert_matches!(
            validate_cluster_id("my cluster"),
            Err(Error::InvalidClusterId(_))
        );
    }
}
