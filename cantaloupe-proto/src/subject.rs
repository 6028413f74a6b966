use alloc::string::String;
use core::{
    fmt::{self, Display},
    ops::Deref,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use bytestring::ByteString;

/// A string that can be used to represent a bus subject
///
/// `Subject` contains a string that is guaranteed [^1] to
/// contain a valid subject that meets the following requirements:
///
/// * The value is not empty
/// * The value has a length less than or equal to 256
/// * The value does not contain any whitespace characters
/// * The value does not contain empty tokens or wrongly
///   placed `*` or `>` characters
///
/// `Subject` can be constructed from [`Subject::from_static`]
/// or any of the `TryFrom` implementations.
///
/// [^1]: Because [`Subject::from_dangerous_value`] is safe to call,
///       unsafe code must not assume any of the above invariants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subject(ByteString);

/// A string that names a broker channel
///
/// A channel name follows the same dotted-token rule as [`Subject`],
/// except that the wildcard characters `*` and `>` are not allowed
/// anywhere in the value. Every channel is backed by an ordered
/// message log, so a name must always refer to exactly one channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelName(ByteString);

impl Subject {
    /// Construct `Subject` from a static string
    ///
    /// # Panics
    ///
    /// Will panic if `value` isn't a valid `Subject`
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid Subject")
    }

    /// Construct a `Subject` from a string, without checking invariants
    ///
    /// This method bypasses the invariant checks implemented by
    /// [`Subject::from_static`] and the `TryFrom` implementations.
    /// Use it only for values assembled out of already validated parts.
    #[expect(
        clippy::missing_panics_doc,
        reason = "The subject validation is only made in debug"
    )]
    #[must_use]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        if cfg!(debug_assertions) {
            if let Err(err) = validate_subject(&value) {
                panic!("Subject {value:?} isn't valid {err:?}");
            }
        }
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ChannelName {
    /// Construct `ChannelName` from a static string
    ///
    /// # Panics
    ///
    /// Will panic if `value` isn't a valid `ChannelName`
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid ChannelName")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// View this channel name as a bus [`Subject`]
    ///
    /// Every valid channel name is also a valid subject, the reverse
    /// does not hold.
    #[must_use]
    pub fn to_subject(&self) -> Subject {
        Subject(self.0.clone())
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_subject(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_subject(&value)?;
        Ok(Self(value.into()))
    }
}

impl TryFrom<ByteString> for ChannelName {
    type Error = ChannelNameValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_channel_name(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for ChannelName {
    type Error = ChannelNameValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_channel_name(&value)?;
        Ok(Self(value.into()))
    }
}

impl From<Subject> for ByteString {
    fn from(value: Subject) -> Self {
        value.0
    }
}

impl From<ChannelName> for ByteString {
    fn from(value: ChannelName) -> Self {
        value.0
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Subject {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Deref for ChannelName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = ByteString::deserialize(deserializer)?;
        s.try_into().map_err(de::Error::custom)
    }
}

impl Serialize for ChannelName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChannelName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = ByteString::deserialize(deserializer)?;
        s.try_into().map_err(de::Error::custom)
    }
}

/// An error encountered while validating [`Subject`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum SubjectValidateError {
    /// The value is empty
    #[error("Subject is empty")]
    Empty,
    /// The value has a length greater than 256
    #[error("Subject is too long")]
    TooLong,
    /// The value contains an Unicode whitespace character
    #[error("Subject contained an illegal whitespace character")]
    IllegalCharacter,
    /// The value contains an empty token
    #[error("Subject contained a broken token")]
    BrokenToken,
    /// The value contains `*` or `>` together with other characters
    /// in the same token, or the `>` is in the non-last token
    #[error("Subject contained a broken wildcard")]
    BrokenWildcard,
}

/// An error encountered while validating [`ChannelName`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ChannelNameValidateError {
    /// The value is empty
    #[error("channel name is empty")]
    Empty,
    /// The value has a length greater than 256
    #[error("channel name is too long")]
    TooLong,
    /// The value contains an Unicode whitespace character
    #[error("channel name contained an illegal whitespace character")]
    IllegalCharacter,
    /// The value contains an empty token, including a trailing dot
    #[error("channel name contained a broken token")]
    BrokenToken,
    /// The value contains the `*` or `>` wildcard character
    #[error("channel name contained a wildcard")]
    Wildcard,
}

fn validate_tokens(value: &str) -> Result<(), ChannelNameValidateError> {
    if value.is_empty() {
        return Err(ChannelNameValidateError::Empty);
    }

    if value.len() > 256 {
        // This is an arbitrary limit, but an unbounded name
        // would also be an unbounded store key
        return Err(ChannelNameValidateError::TooLong);
    }

    if value.chars().any(char::is_whitespace) {
        return Err(ChannelNameValidateError::IllegalCharacter);
    }

    if value.split('.').any(str::is_empty) {
        return Err(ChannelNameValidateError::BrokenToken);
    }

    Ok(())
}

fn validate_subject(subject: &str) -> Result<(), SubjectValidateError> {
    validate_tokens(subject).map_err(|err| match err {
        ChannelNameValidateError::Empty => SubjectValidateError::Empty,
        ChannelNameValidateError::TooLong => SubjectValidateError::TooLong,
        ChannelNameValidateError::IllegalCharacter => SubjectValidateError::IllegalCharacter,
        ChannelNameValidateError::BrokenToken | ChannelNameValidateError::Wildcard => {
            SubjectValidateError::BrokenToken
        }
    })?;

    let mut tokens = subject.split('.').peekable();
    while let Some(token) = tokens.next() {
        if token.len() > 1 && token.contains(['*', '>']) {
            return Err(SubjectValidateError::BrokenWildcard);
        }

        if token == ">" && tokens.peek().is_some() {
            return Err(SubjectValidateError::BrokenWildcard);
        }
    }

    Ok(())
}

fn validate_channel_name(name: &str) -> Result<(), ChannelNameValidateError> {
    validate_tokens(name)?;

    if name.contains(['*', '>']) {
        return Err(ChannelNameValidateError::Wildcard);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bytestring::ByteString;

    use super::{ChannelName, ChannelNameValidateError, Subject, SubjectValidateError};

    #[test]
    fn valid_subjects() {
        let subjects = [
            "cmd",
            "cmd.endpoint",
            "cmd.endpoint.detail",
            "cmd.*.detail",
            "cmd.*.*",
            "cmd.endpoint.>",
        ];
        for subject in subjects {
            let s = Subject::try_from(ByteString::from_static(subject)).unwrap();
            assert_eq!(subject, s.as_str());
        }
    }

    #[test]
    fn invalid_subjects() {
        let subjects = [
            ("", SubjectValidateError::Empty),
            ("cmd ", SubjectValidateError::IllegalCharacter),
            (" cmd", SubjectValidateError::IllegalCharacter),
            ("cmd.endp oint", SubjectValidateError::IllegalCharacter),
            ("cmd.endpoint\r", SubjectValidateError::IllegalCharacter),
            ("cmd..endpoint", SubjectValidateError::BrokenToken),
            (".cmd.endpoint", SubjectValidateError::BrokenToken),
            ("cmd.endpoint.", SubjectValidateError::BrokenToken),
            ("cmd.**", SubjectValidateError::BrokenWildcard),
            ("cmd.a*.endpoint", SubjectValidateError::BrokenWildcard),
            ("cmd.>.endpoint", SubjectValidateError::BrokenWildcard),
            ("cmd.endpoint.>a", SubjectValidateError::BrokenWildcard),
        ];
        for (subject, expected_err) in subjects {
            let err = Subject::try_from(ByteString::from_static(subject)).unwrap_err();
            assert_eq!(expected_err, err);
        }
    }

    #[test]
    fn valid_channel_names() {
        let names = ["foo", "foo.bar", "foo.bar.baz", "foo-1.bar_2"];
        for name in names {
            let c = ChannelName::try_from(ByteString::from_static(name)).unwrap();
            assert_eq!(name, c.as_str());
            assert_eq!(name, c.to_subject().as_str());
        }
    }

    #[test]
    fn invalid_channel_names() {
        let names = [
            ("", ChannelNameValidateError::Empty),
            ("foo bar", ChannelNameValidateError::IllegalCharacter),
            ("foo..bar", ChannelNameValidateError::BrokenToken),
            ("foo.bar.", ChannelNameValidateError::BrokenToken),
            (".foo", ChannelNameValidateError::BrokenToken),
            ("foo*.bar", ChannelNameValidateError::Wildcard),
            ("foo.bar*", ChannelNameValidateError::Wildcard),
            ("foo.*", ChannelNameValidateError::Wildcard),
            ("foo.>", ChannelNameValidateError::Wildcard),
            ("*", ChannelNameValidateError::Wildcard),
            (">", ChannelNameValidateError::Wildcard),
        ];
        for (name, expected_err) in names {
            let err = ChannelName::try_from(ByteString::from_static(name)).unwrap_err();
            assert_eq!(expected_err, err);
        }
    }

    #[test]
    fn channel_name_wildcard_tokens_rejected() {
        // "foo.>.*" is a broken subject too, but for channels even
        // well placed wildcards must be refused
        let err = ChannelName::try_from(ByteString::from_static("foo.>.*")).unwrap_err();
        assert_eq!(ChannelNameValidateError::Wildcard, err);
    }
}
