//! Streaming pub/sub broker layered on a subject-based message bus
//!
//! The broker accepts publications, assigns them monotonic sequence
//! numbers per channel, persists them into ordered message logs and
//! delivers them to subscribers with at-least-once semantics:
//! per-message acks, timer-driven redelivery, durable resumption and
//! queue-group load balancing. Client liveness is tracked with
//! heartbeats, duplicate client ids are arbitrated, and durable state
//! is recovered from the store on restart.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cantaloupe::{Broker, MemoryBus};
//!
//! # async fn run() -> Result<(), cantaloupe::Error> {
//! let bus = Arc::new(MemoryBus::new());
//! let broker = Broker::start(Broker::options().cluster_id("demo"), bus).await?;
//! // clients now connect via the bus on broker.discover_subject()
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use cantaloupe_proto as proto;

pub use self::bus::{Bus, BusError, BusMessage, BusSubscription, MemoryBus};
pub use self::config::{BrokerOptions, ChannelLimits, StoreKind};
pub use self::error::{Error, Result};
pub use self::server::{
    Broker, ChannelSnapshot, QueueGroupSnapshot, SubscriptionSnapshot,
};
pub use self::store::{
    ClientRecord, FileStore, MemoryStore, RecoveredChannel, RecoveredState,
    RecoveredSubscription, Store, StoredMessage, SubscriptionRecord,
};

mod bus;
mod channel;
mod config;
mod delivery;
mod error;
mod registry;
mod server;
mod store;
mod sub;
