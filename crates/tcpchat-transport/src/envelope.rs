//! Chat envelope wire format.
//!
//! The transport never looks inside these; they are what the chat layer puts
//! in the byte buffers it hands to [`DuplexConnection::send`](crate::DuplexConnection::send).
//!
//! ```json
//! {"Type": 0, "Payload": "{\"Content\":\"hi\",\"User\":{\"Username\":\"ana\"},\"Time\":\"...\"}"}
//! ```
//!
//! `Type` is `0` for a message and `1` for a profile announcement. The
//! payload is the inner object serialized to a JSON string.

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};

use crate::ChatTransportError;

/// Display name used when none (or a blank one) is given.
pub const DEFAULT_USERNAME: &str = "User";

/// Envelope discriminator. Unrecognised values survive decoding so they can
/// be skipped instead of failing the whole read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum PacketKind {
    Message,
    UserProfile,
    Unknown(i64),
}

impl From<i64> for PacketKind {
    fn from(value: i64) -> Self {
        match value {
            0 => PacketKind::Message,
            1 => PacketKind::UserProfile,
            other => PacketKind::Unknown(other),
        }
    }
}

impl From<PacketKind> for i64 {
    fn from(kind: PacketKind) -> Self {
        match kind {
            PacketKind::Message => 0,
            PacketKind::UserProfile => 1,
            PacketKind::Unknown(other) => other,
        }
    }
}

/// A user's display name, sent as a snapshot when a chat opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(rename = "Username")]
    username: Option<String>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::new(DEFAULT_USERNAME)
    }
}

impl UserProfile {
    /// Blank names fall back to [`DEFAULT_USERNAME`].
    pub fn new(username: &str) -> Self {
        let username = username.trim();
        let username = if username.is_empty() {
            DEFAULT_USERNAME
        } else {
            username
        };
        Self {
            username: Some(username.to_string()),
        }
    }

    pub fn username(&self) -> &str {
        match self.username.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => DEFAULT_USERNAME,
        }
    }
}

/// A chat message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "Content")]
    content: Option<String>,

    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    user: Option<UserProfile>,

    /// Older peers send a bare name instead of a profile.
    #[serde(rename = "Username", default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,

    #[serde(rename = "Time", default)]
    time: Option<DateTime<FixedOffset>>,
}

impl ChatMessage {
    /// A message from `sender`, stamped with the local time.
    pub fn new(sender: &UserProfile, content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            user: Some(sender.clone()),
            username: None,
            time: Some(Local::now().fixed_offset()),
        }
    }

    /// Whether `content` is worth sending (non-blank).
    pub fn is_sendable(content: &str) -> bool {
        !content.trim().is_empty()
    }

    pub fn content(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    /// Sender name: the profile if present, else the legacy name field.
    pub fn sender_name(&self) -> &str {
        match (&self.user, self.username.as_deref()) {
            (Some(user), _) => user.username(),
            (None, Some(name)) if !name.trim().is_empty() => name,
            _ => DEFAULT_USERNAME,
        }
    }

    pub fn time(&self) -> Option<DateTime<FixedOffset>> {
        self.time
    }
}

/// Decoded envelope contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Message(ChatMessage),
    Profile(UserProfile),
}

/// Outer envelope: a kind tag plus the inner object as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "Type", default)]
    kind: Option<PacketKind>,

    #[serde(rename = "Payload", default)]
    payload: Option<String>,
}

impl Packet {
    pub fn message(message: &ChatMessage) -> Result<Self, ChatTransportError> {
        Self::wrap(PacketKind::Message, message)
    }

    pub fn profile(profile: &UserProfile) -> Result<Self, ChatTransportError> {
        Self::wrap(PacketKind::UserProfile, profile)
    }

    fn wrap<T: Serialize>(kind: PacketKind, inner: &T) -> Result<Self, ChatTransportError> {
        let payload = serde_json::to_string(inner).map_err(ChatTransportError::Serialization)?;
        Ok(Self {
            kind: Some(kind),
            payload: Some(payload),
        })
    }

    pub fn kind(&self) -> Option<PacketKind> {
        self.kind
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChatTransportError> {
        serde_json::to_vec(self).map_err(ChatTransportError::Serialization)
    }

    /// Deserialize from UTF-8 JSON bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ChatTransportError> {
        serde_json::from_slice(data).map_err(ChatTransportError::Deserialization)
    }

    /// Decode the payload under the type named by `kind`.
    ///
    /// `Ok(None)` for unknown kinds or a missing payload; those are skipped,
    /// not treated as errors.
    pub fn body(&self) -> Result<Option<PacketBody>, ChatTransportError> {
        let (Some(kind), Some(payload)) = (self.kind, self.payload.as_deref()) else {
            return Ok(None);
        };
        let body = match kind {
            PacketKind::Message => PacketBody::Message(
                serde_json::from_str(payload).map_err(ChatTransportError::Deserialization)?,
            ),
            PacketKind::UserProfile => PacketBody::Profile(
                serde_json::from_str(payload).map_err(ChatTransportError::Deserialization)?,
            ),
            PacketKind::Unknown(other) => {
                tracing::debug!(kind = other, "ignoring packet of unknown kind");
                return Ok(None);
            }
        };
        Ok(Some(body))
    }
}

/// Decode one received buffer into its body, if it carries a known kind.
pub fn decode(data: &[u8]) -> Result<Option<PacketBody>, ChatTransportError> {
    Packet::from_bytes(data)?.body()
}

/// Reassembles packets from read-sized chunks.
///
/// Reads are delivered as they come off the socket, so one packet can span
/// several chunks and one chunk can carry several packets. A trailing partial
/// packet is kept until the next [`push`](Self::push).
#[derive(Debug, Default)]
pub struct PacketStream {
    pending: Vec<u8>,
}

impl PacketStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every packet it completes.
    ///
    /// On malformed input the buffered bytes are discarded so the stream can
    /// resynchronise on the next packet.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Packet>, ChatTransportError> {
        self.pending.extend_from_slice(chunk);

        let mut packets = Vec::new();
        let (consumed, failure) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.pending).into_iter::<Packet>();
            loop {
                match stream.next() {
                    Some(Ok(packet)) => packets.push(packet),
                    Some(Err(e)) if e.is_eof() => break (stream.byte_offset(), None),
                    Some(Err(e)) => break (0, Some(e)),
                    None => break (stream.byte_offset(), None),
                }
            }
        };

        if let Some(e) = failure {
            self.pending.clear();
            return Err(ChatTransportError::Deserialization(e));
        }
        self.pending.drain(..consumed);
        Ok(packets)
    }

    /// Bytes held back waiting for the rest of a packet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
