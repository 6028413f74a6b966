use cantaloupe_proto::ProtocolError;

use crate::bus::BusError;

/// An error encountered while starting or operating the broker
///
/// Protocol errors are reported to clients in-band and only surface
/// here when a handler needs to abort early; configuration and store
/// errors are fatal at startup.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store record: {0}")]
    Corrupt(&'static str),

    #[error("unknown channel {0}")]
    UnknownChannel(cantaloupe_proto::ChannelName),

    #[error("unknown store kind {0:?}")]
    UnknownStoreKind(String),

    #[error("the file store requires a directory")]
    MissingStoreDir,

    #[error("invalid cluster id {0:?}")]
    InvalidClusterId(String),

    #[error("recovered cluster id {found:?} does not match configured {expected:?}")]
    ClusterIdMismatch { expected: String, found: String },

    #[error("broker has been shut down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
