use bytestring::ByteString;

/// An error reported in-band in a control response
///
/// The `Display` representation of each variant is the exact string
/// carried in the response's `error` field; an empty field means
/// success. Protocol errors never mutate broker state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid connect request")]
    InvalidConnectRequest,
    #[error("invalid publish request")]
    InvalidPublishRequest,
    #[error("invalid subscription request")]
    InvalidSubscriptionRequest,
    #[error("invalid unsubscribe request")]
    InvalidUnsubscribeRequest,
    #[error("invalid close request")]
    InvalidCloseRequest,

    #[error("invalid client id")]
    InvalidClientId,
    #[error("client id already registered")]
    ClientIdAlreadyRegistered,
    #[error("unknown client id")]
    UnknownClientId,

    #[error("invalid channel")]
    InvalidChannel,

    #[error("too many channels")]
    TooManyChannels,
    #[error("too many subscriptions")]
    TooManySubscriptions,

    #[error("unknown start sequence")]
    UnknownSequence,
    #[error("unknown time delta")]
    UnknownTimeDelta,

    #[error("subscription not owned by client")]
    NotOwnedByClient,

    #[error("{raw_message}")]
    Other { raw_message: ByteString },
}

impl ProtocolError {
    /// Parse the `error` field of a control response
    ///
    /// Returns `None` for an empty field, the protocol's encoding
    /// of success.
    #[must_use]
    pub fn parse(raw_message: ByteString) -> Option<Self> {
        let err = match raw_message.trim() {
            "" => return None,
            "invalid connect request" => Self::InvalidConnectRequest,
            "invalid publish request" => Self::InvalidPublishRequest,
            "invalid subscription request" => Self::InvalidSubscriptionRequest,
            "invalid unsubscribe request" => Self::InvalidUnsubscribeRequest,
            "invalid close request" => Self::InvalidCloseRequest,
            "invalid client id" => Self::InvalidClientId,
            "client id already registered" => Self::ClientIdAlreadyRegistered,
            "unknown client id" => Self::UnknownClientId,
            "invalid channel" => Self::InvalidChannel,
            "too many channels" => Self::TooManyChannels,
            "too many subscriptions" => Self::TooManySubscriptions,
            "unknown start sequence" => Self::UnknownSequence,
            "unknown time delta" => Self::UnknownTimeDelta,
            "subscription not owned by client" => Self::NotOwnedByClient,
            _ => Self::Other { raw_message },
        };
        Some(err)
    }
}
