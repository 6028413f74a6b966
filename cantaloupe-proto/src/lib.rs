#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub use self::client_id::ClientId;
pub use self::control::{
    decode, encode, Ack, CloseRequest, CloseResponse, ConnectRequest, ConnectResponse, MsgProto,
    PubAck, PubMsg, StartPosition, SubscriptionRequest, SubscriptionResponse, UnsubscribeRequest,
};
pub use self::protocol_error::ProtocolError;
pub use self::subject::{ChannelName, Subject};

mod client_id;
mod control;
mod protocol_error;
mod subject;

pub mod error {
    pub use super::client_id::ClientIdValidateError;
    pub use super::control::DecodeError;
    pub use super::subject::{ChannelNameValidateError, SubjectValidateError};
}
