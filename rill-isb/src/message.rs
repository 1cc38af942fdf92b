//! The inter-step buffer message model.

use bytes::Bytes;
use time::OffsetDateTime;

use crate::Offset;

/// Metadata carried alongside every message payload.
///
/// Headers survive the trip through the broker verbatim; readers reconstruct them
/// from broker-visible headers written by the upstream writer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Header {
    /// A unique identifier of the message.
    pub id: String,
    /// The routing key of the message.
    pub key: Bytes,
    /// The event time of the message.
    pub event_time: Option<OffsetDateTime>,
    /// The window start time, set only for windowed messages.
    pub start_time: Option<OffsetDateTime>,
    /// The window end time, set only for windowed messages.
    pub end_time: Option<OffsetDateTime>,
    /// Marks the message as a window control message.
    pub is_window: bool,
}

/// An opaque message payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Body {
    pub payload: Bytes,
}

/// A message moving between two pipeline vertices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    /// Construct a new message with the given id and payload.
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            header: Header {
                id: id.into(),
                ..Default::default()
            },
            body: Body { payload: payload.into() },
        }
    }
}

/// A message delivered by a reader, paired with its read offset.
#[derive(Clone)]
pub struct ReadMessage {
    pub message: Message,
    pub offset: Offset,
}
