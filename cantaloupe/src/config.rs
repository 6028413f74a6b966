use std::{path::PathBuf, str::FromStr, time::Duration};

use cantaloupe_proto::Subject;

use crate::error::Error;

pub(crate) const DEFAULT_CLUSTER_ID: &str = "cantaloupe";
pub(crate) const DEFAULT_DISCOVER_PREFIX: &str = "_CLP.discover";

/// Which persistence backend the broker runs on
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum StoreKind {
    /// Keep everything in process memory, losing it on restart
    #[default]
    Memory,
    /// Persist to append-only logs in a directory and recover on restart
    File,
}

impl FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            _ if s.eq_ignore_ascii_case("memory") => Ok(Self::Memory),
            _ if s.eq_ignore_ascii_case("file") => Ok(Self::File),
            _ => Err(Error::UnknownStoreKind(s.to_owned())),
        }
    }
}

/// Admission limits applied to every channel
///
/// `max_channels` and `max_subscriptions` reject the request that would
/// exceed them. `max_msgs`, `max_bytes` and `max_age` bound the message
/// log by evicting its oldest entries instead; a zero value disables
/// the corresponding bound.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelLimits {
    pub max_channels: usize,
    pub max_subscriptions: usize,
    pub max_msgs: usize,
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            max_channels: 100,
            max_subscriptions: 1000,
            max_msgs: 1_000_000,
            max_bytes: 1024 * 1024 * 1024,
            max_age: Duration::ZERO,
        }
    }
}

/// Configuration for a [`Broker`]
///
/// Obtained from [`Broker::options`] or [`BrokerOptions::new`] and
/// passed to [`Broker::start`].
///
/// [`Broker`]: crate::Broker
/// [`Broker::start`]: crate::Broker::start
/// [`Broker::options`]: crate::Broker::options
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub(crate) cluster_id: String,
    pub(crate) discover_prefix: Subject,
    pub(crate) store: StoreKind,
    pub(crate) store_dir: Option<PathBuf>,
    pub(crate) limits: ChannelLimits,
    pub(crate) hb_interval: Duration,
    pub(crate) hb_timeout: Duration,
    pub(crate) max_failed_heartbeats: u32,
    pub(crate) dup_cid_timeout: Duration,
    pub(crate) dup_max_cid_routines: usize,
}

impl BrokerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cluster_id: DEFAULT_CLUSTER_ID.to_owned(),
            discover_prefix: Subject::from_static(DEFAULT_DISCOVER_PREFIX),
            store: StoreKind::Memory,
            store_dir: None,
            limits: ChannelLimits::default(),
            hb_interval: Duration::from_secs(30),
            hb_timeout: Duration::from_secs(10),
            max_failed_heartbeats: 10,
            dup_cid_timeout: Duration::from_secs(1),
            dup_max_cid_routines: 100,
        }
    }

    /// Name of the broker cluster
    ///
    /// Clients reach the broker on `<discover_prefix>.<cluster_id>`,
    /// and a file store refuses to recover state written under a
    /// different cluster id.
    ///
    /// Default: `cantaloupe`
    #[must_use]
    pub fn cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self
    }

    /// Subject prefix on which connect requests are accepted
    ///
    /// Default: `_CLP.discover`
    #[must_use]
    pub fn discover_prefix(mut self, discover_prefix: Subject) -> Self {
        self.discover_prefix = discover_prefix;
        self
    }

    /// Persistence backend
    ///
    /// [`StoreKind::File`] additionally requires [`BrokerOptions::store_dir`].
    ///
    /// Default: [`StoreKind::Memory`]
    #[must_use]
    pub fn store(mut self, store: StoreKind) -> Self {
        self.store = store;
        self
    }

    /// Directory for the file store's logs
    ///
    /// Default: none
    #[must_use]
    pub fn store_dir(mut self, store_dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(store_dir.into());
        self
    }

    /// Per-channel admission limits
    ///
    /// Default: [`ChannelLimits::default`]
    #[must_use]
    pub fn limits(mut self, limits: ChannelLimits) -> Self {
        self.limits = limits;
        self
    }

    /// How often every connected client is pinged
    ///
    /// Default: 30 seconds
    #[must_use]
    pub fn heartbeat_interval(mut self, hb_interval: Duration) -> Self {
        self.hb_interval = hb_interval;
        self
    }

    /// How long to wait for a heartbeat reply
    ///
    /// Default: 10 seconds
    #[must_use]
    pub fn heartbeat_timeout(mut self, hb_timeout: Duration) -> Self {
        self.hb_timeout = hb_timeout;
        self
    }

    /// How many consecutive missed heartbeats get a client purged
    ///
    /// Default: 10
    #[must_use]
    pub fn max_failed_heartbeats(mut self, max_failed_heartbeats: u32) -> Self {
        self.max_failed_heartbeats = max_failed_heartbeats;
        self
    }

    /// How long to probe the existing client when a connect reuses
    /// a registered client id
    ///
    /// Default: 1 second
    #[must_use]
    pub fn duplicate_cid_timeout(mut self, dup_cid_timeout: Duration) -> Self {
        self.dup_cid_timeout = dup_cid_timeout;
        self
    }

    /// How many duplicate-client-id arbitrations may run in parallel
    ///
    /// Further duplicate connects wait for a free slot.
    ///
    /// Default: 100
    #[must_use]
    pub fn max_duplicate_cid_routines(mut self, dup_max_cid_routines: usize) -> Self {
        self.dup_max_cid_routines = dup_max_cid_routines;
        self
    }
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self::new()
    }
}
