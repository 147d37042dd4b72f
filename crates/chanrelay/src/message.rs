//! JSON shapes exchanged with browser clients.

use serde::{Deserialize, Serialize};

/// A message sent by a client: publish `content` to channel `id`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientMessage {
    /// Channel the content is published under.
    pub id: String,
    /// Opaque text payload, relayed verbatim.
    pub content: String,
}

impl ClientMessage {
    /// Decode a text or binary frame body.
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// A message delivered to a client. The channel is implied by registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery<'a> {
    /// Opaque text payload as received from the broker.
    pub content: &'a str,
}

impl Delivery<'_> {
    /// Encode for a WebSocket text frame.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing a struct of one string field cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
