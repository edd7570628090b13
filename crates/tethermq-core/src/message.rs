//! Inbound message type.

use bytes::Bytes;

/// A message received from the broker, waiting for the owner context.
///
/// `sequence` is the arrival order assigned by the dispatch queue; drains
/// deliver in increasing sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: String,

    /// The binary payload of the message.
    pub payload: Bytes,

    /// Arrival order across the hand-off boundary.
    pub sequence: u64,
}

impl InboundMessage {
    /// Creates a new `InboundMessage`.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, sequence: u64) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            sequence,
        }
    }

    /// Returns the size of the message payload in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Payload as UTF-8, if it is valid text.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
