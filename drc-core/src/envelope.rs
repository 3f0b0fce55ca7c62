// ABOUTME: Envelope codec for bus messages: `{type, data}` JSON with colon-delimited tags.
// ABOUTME: Decodes into a validated Tag plus a closed EventKind view with an Unknown fallback.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Separator between tag segments (`domain:action:subaction`).
pub const TAG_SEPARATOR: char = ':';

/// Errors produced while parsing a tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    #[error("tag is empty")]
    Empty,
    #[error("tag '{0}' contains an empty segment")]
    EmptySegment(String),
}

/// Errors produced while decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("invalid envelope type: {0}")]
    InvalidTag(#[from] TagError),
}

/// A validated, colon-delimited message tag.
///
/// The first segment names the owning subsystem, later segments name the
/// action and sub-action. Single-segment tags (e.g. `clientAckClose`) are valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    pub fn parse(raw: &str) -> Result<Self, TagError> {
        if raw.is_empty() {
            return Err(TagError::Empty);
        }
        if raw.split(TAG_SEPARATOR).any(str::is_empty) {
            return Err(TagError::EmptySegment(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(TAG_SEPARATOR)
    }

    /// Owning subsystem (first segment).
    pub fn domain(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }

    pub fn action(&self) -> Option<&str> {
        self.segments().nth(1)
    }

    pub fn subaction(&self) -> Option<&str> {
        self.segments().nth(2)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from(self)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Tags the core itself understands. Everything else is `Unknown` and is
/// routed purely by its raw tag string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    IrcJoin,
    IrcPart,
    IrcKick,
    IrcQuit,
    IrcNick,
    IrcNames,
    SpawnProcess,
    ClientAckClose,
    Unknown(String),
}

impl EventKind {
    /// Canonical wire tag for this kind.
    pub fn tag(&self) -> &str {
        match self {
            Self::IrcJoin => "irc:join",
            Self::IrcPart => "irc:part",
            Self::IrcKick => "irc:kick",
            Self::IrcQuit => "irc:quit",
            Self::IrcNick => "irc:nick",
            Self::IrcNames => "irc:names",
            Self::SpawnProcess => "spawnProcess",
            Self::ClientAckClose => "clientAckClose",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<&Tag> for EventKind {
    fn from(tag: &Tag) -> Self {
        match tag.as_str() {
            "irc:join" => Self::IrcJoin,
            "irc:part" => Self::IrcPart,
            "irc:kick" => Self::IrcKick,
            "irc:quit" => Self::IrcQuit,
            "irc:nick" => Self::IrcNick,
            "irc:names" => Self::IrcNames,
            "spawnProcess" => Self::SpawnProcess,
            "clientAckClose" => Self::ClientAckClose,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tag: Tag,
    /// Payload; `Value::Null` when the sender omitted `data`.
    pub data: Value,
}

impl Envelope {
    pub fn new(tag: Tag, data: Value) -> Self {
        Self { tag, data }
    }

    /// Build an envelope from a raw tag string.
    pub fn from_parts(tag: &str, data: Value) -> Result<Self, TagError> {
        Ok(Self::new(Tag::parse(tag)?, data))
    }

    pub fn kind(&self) -> EventKind {
        self.tag.kind()
    }

    /// Serialize to the UTF-8 JSON wire form.
    pub fn encode(&self) -> String {
        let wire = WireEnvelope {
            kind: self.tag.to_string(),
            data: self.data.clone(),
        };
        // Serializing a String + Value into JSON cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// Deserialize `data` into a handler-specific shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            anyhow::anyhow!("invalid data for '{}': {}", self.tag, e)
        })
    }
}

/// Encode a tag and payload into a wire message.
pub fn encode<T: Serialize>(tag: &str, data: &T) -> anyhow::Result<String> {
    let tag = Tag::parse(tag)?;
    let data = serde_json::to_value(data)?;
    Ok(Envelope::new(tag, data).encode())
}

/// Decode a wire message. Only structural validity is checked; the shape of
/// `data` is the handler's concern.
pub fn decode(wire: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(wire)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let wire: WireEnvelope = serde_json::from_value(value)?;
    let tag = Tag::parse(&wire.kind)?;
    Ok(Envelope::new(tag, wire.data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_segments() {
        let tag = Tag::parse("irc:responseWhois:extra").unwrap();
        assert_eq!(tag.domain(), "irc");
        assert_eq!(tag.action(), Some("responseWhois"));
        assert_eq!(tag.subaction(), Some("extra"));
    }

    #[test]
    fn test_single_segment_tag() {
        let tag = Tag::parse("clientAckClose").unwrap();
        assert_eq!(tag.domain(), "clientAckClose");
        assert_eq!(tag.action(), None);
        assert_eq!(tag.kind(), EventKind::ClientAckClose);
    }

    #[test]
    fn test_tag_rejects_empty_segments() {
        assert_eq!(Tag::parse(""), Err(TagError::Empty));
        assert!(matches!(Tag::parse("irc::join"), Err(TagError::EmptySegment(_))));
        assert!(matches!(Tag::parse("irc:"), Err(TagError::EmptySegment(_))));
    }

    #[test]
    fn test_unknown_kind_keeps_raw_tag() {
        let tag = Tag::parse("discord:send").unwrap();
        assert_eq!(tag.kind(), EventKind::Unknown("discord:send".to_string()));
        assert_eq!(tag.kind().tag(), "discord:send");
        assert!(!tag.kind().is_known());
    }

    #[test]
    fn test_decode_without_data() {
        let env = decode(r#"{"type":"irc:disconnected"}"#).unwrap();
        assert_eq!(env.tag.as_str(), "irc:disconnected");
        assert!(env.data.is_null());
        assert_eq!(env.encode(), r#"{"type":"irc:disconnected"}"#);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode("[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(decode(r#"{"data":{}}"#), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"type":"","data":{}}"#),
            Err(DecodeError::InvalidTag(TagError::Empty))
        ));
    }

    #[test]
    fn test_encode_and_typed_data() {
        #[derive(serde::Deserialize)]
        struct Join {
            network: String,
            nick: String,
        }

        let wire = encode("irc:join", &json!({"network": "libera", "nick": "alice"})).unwrap();
        let env = decode(&wire).unwrap();
        assert_eq!(env.kind(), EventKind::IrcJoin);
        let join: Join = env.data_as().unwrap();
        assert_eq!(join.network, "libera");
        assert_eq!(join.nick, "alice");
        assert!(env.data_as::<Vec<String>>().is_err());
    }
}
