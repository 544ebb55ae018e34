//! Opaque Matrix identifier newtypes and the `mxc://` content URI.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier parse failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdParseError {
    /// The value is not of the form `mxc://<server_name>/<media_id>`.
    #[error("invalid mxc uri '{0}'")]
    InvalidMxc(String),
}

/// Matrix user identifier (`@localpart:server`), kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Matrix room identifier (`!opaque:server`), kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Matrix event identifier (`$opaque`), kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Matrix content URI of the form `mxc://<server_name>/<media_id>`.
///
/// Parsing is strict: exactly one `/` after the authority, both parts
/// non-empty. Formatting round-trips the input exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mxc {
    server_name: String,
    media_id: String,
}

impl Mxc {
    pub fn new(server_name: impl Into<String>, media_id: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            media_id: media_id.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn media_id(&self) -> &str {
        &self.media_id
    }

    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        let rest = value
            .strip_prefix("mxc://")
            .ok_or_else(|| IdParseError::InvalidMxc(value.to_owned()))?;
        let (server_name, media_id) = rest
            .split_once('/')
            .ok_or_else(|| IdParseError::InvalidMxc(value.to_owned()))?;
        if server_name.is_empty() || media_id.is_empty() || media_id.contains('/') {
            return Err(IdParseError::InvalidMxc(value.to_owned()));
        }
        Ok(Self::new(server_name, media_id))
    }
}

impl fmt::Display for Mxc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mxc://{}/{}", self.server_name, self.media_id)
    }
}

impl FromStr for Mxc {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for Mxc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Mxc {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_round_trips_mxc() {
        let mxc = Mxc::parse("mxc://example.org/abc123").expect("valid mxc should parse");
        assert_eq!(mxc.server_name(), "example.org");
        assert_eq!(mxc.media_id(), "abc123");
        assert_eq!(mxc.to_string(), "mxc://example.org/abc123");
    }

    #[test]
    fn rejects_malformed_mxc_shapes() {
        for bad in [
            "https://example.org/abc",
            "mxc://example.org",
            "mxc://example.org/",
            "mxc:///abc",
            "mxc://example.org/a/b",
            "mxc://",
        ] {
            assert!(Mxc::parse(bad).is_err(), "should reject '{bad}'");
        }
    }

    #[test]
    fn mxc_serializes_as_string() {
        let mxc = Mxc::new("example.org", "media1");
        let json = serde_json::to_string(&mxc).expect("mxc should serialize");
        assert_eq!(json, "\"mxc://example.org/media1\"");

        let back: Mxc = serde_json::from_str(&json).expect("mxc should deserialize");
        assert_eq!(back, mxc);
    }

    #[test]
    fn identifier_newtypes_compare_by_value() {
        assert_eq!(UserId::from("@alice:h"), UserId::new("@alice:h"));
        assert_eq!(RoomId::from("!r:h").to_string(), "!r:h");
        assert_eq!(EventId::from("$e").as_str(), "$e");
    }
}
