use alloc::string::String;
use core::{
    fmt::{self, Display},
    ops::Deref,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use bytestring::ByteString;

/// A string that identifies a connected client
///
/// Client ids appear inside control subjects and store keys, so the
/// accepted alphabet is deliberately narrow: ASCII alphanumerics,
/// underscore and hyphen. Anything else, including the `.`, `,` and `:`
/// punctuation reserved by the bus, is refused.
///
/// `ClientId` can be constructed from [`ClientId::from_static`]
/// or any of the `TryFrom` implementations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(ByteString);

impl ClientId {
    /// Construct `ClientId` from a static string
    ///
    /// # Panics
    ///
    /// Will panic if `value` isn't a valid `ClientId`
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid ClientId")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for ClientId {
    type Error = ClientIdValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_client_id(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for ClientId {
    type Error = ClientIdValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_client_id(&value)?;
        Ok(Self(value.into()))
    }
}

impl From<ClientId> for ByteString {
    fn from(value: ClientId) -> Self {
        value.0
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = ByteString::deserialize(deserializer)?;
        s.try_into().map_err(de::Error::custom)
    }
}

/// An error encountered while validating [`ClientId`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ClientIdValidateError {
    /// The value is empty
    #[error("client id is empty")]
    Empty,
    /// The value has a length greater than 128
    #[error("client id is too long")]
    TooLong,
    /// The value contains a character outside `[A-Za-z0-9_-]`
    #[error("client id contained an illegal character")]
    IllegalCharacter,
}

fn validate_client_id(client_id: &str) -> Result<(), ClientIdValidateError> {
    if client_id.is_empty() {
        return Err(ClientIdValidateError::Empty);
    }

    if client_id.len() > 128 {
        return Err(ClientIdValidateError::TooLong);
    }

    if !client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ClientIdValidateError::IllegalCharacter);
    }

    Ok(())
}
