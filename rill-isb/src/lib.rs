//! Inter-step buffer abstractions.
//!
//! A buffer is a named, ordered, durable stream on the broker carrying messages for
//! one pipeline edge. Processors interact with buffers only through the
//! [`BufferReader`] and [`BufferWriter`] contracts; broker implementations plug in at
//! the construction site.

pub mod jetstream;
pub mod lifecycle;
pub mod message;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use message::{Body, Header, Message, ReadMessage};

/// Inter-step buffer error variants.
#[derive(Debug, Error)]
pub enum IsbError {
    /// The broker connection could not be established.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    /// A reader or writer could not be constructed against its buffer.
    #[error("failed to set up buffer {buffer:?}: {reason}")]
    SetupFailed { buffer: String, reason: String },
    /// A batched read failed for a reason other than a read timeout.
    #[error("failed to fetch messages from buffer {buffer:?}: {reason}")]
    FetchFailed { buffer: String, reason: String },
    /// The buffer rejected a write because it is at capacity.
    #[error("buffer {0:?} is full")]
    BufferFull(String),
    /// A message could not be written to a buffer.
    #[error("failed to write message to buffer {buffer:?}: {reason}")]
    WriteFailed { buffer: String, reason: String },
    /// A message could not be acknowledged.
    #[error("failed to ack message {seq}: {reason}")]
    AckFailed { seq: u64, reason: String },
}

/// An opaque token identifying one delivered message.
///
/// Ownership: created by a reader for each delivered message and owned by whoever
/// holds the corresponding [`ReadMessage`]. An offset must be acked exactly once or
/// abandoned, in which case the broker redelivers the message once its ack-wait
/// expires. Acks are idempotent; repeated or late acks return success.
#[async_trait]
pub trait AckOffset: std::fmt::Display + Send + Sync {
    /// The broker-assigned stream sequence of the message.
    fn sequence(&self) -> u64;

    /// Acknowledge the message with the broker.
    async fn ack(&self) -> Result<(), IsbError>;
}

/// A shared handle to a delivered message's offset.
pub type Offset = Arc<dyn AckOffset>;

/// The reading half of an inter-step buffer.
#[async_trait]
pub trait BufferReader: Send + Sync {
    /// A stable identifier for this reader, used for metrics.
    fn name(&self) -> &str;

    /// Pull up to `count` messages from the buffer.
    ///
    /// A read timeout is not an error; it yields an empty batch. Broker order is
    /// preserved in the returned slice.
    async fn read(&self, count: usize) -> Result<Vec<ReadMessage>, IsbError>;

    /// Acknowledge the given offsets.
    ///
    /// Acks are fired concurrently; the call returns only once every ack has
    /// completed or failed. The result is positional: `result[i]` corresponds to
    /// `offsets[i]`, with `None` meaning success.
    async fn ack(&self, offsets: &[Offset]) -> Vec<Option<IsbError>> {
        ack_all(offsets).await
    }

    /// Release this reader. Idempotent.
    async fn close(&self) -> Result<(), IsbError>;
}

/// The writing half of an inter-step buffer.
#[async_trait]
pub trait BufferWriter: Send + Sync {
    /// A stable identifier for this writer, used for metrics.
    fn name(&self) -> &str;

    /// Write the given messages, returning one positional result per message.
    ///
    /// Message headers are applied as broker-visible headers so a downstream reader
    /// reconstructs them verbatim.
    async fn write(&self, messages: Vec<Message>) -> Vec<Option<IsbError>>;

    /// Release this writer. Idempotent.
    async fn close(&self) -> Result<(), IsbError>;
}

/// Acknowledge all offsets concurrently, preserving positional alignment.
pub async fn ack_all(offsets: &[Offset]) -> Vec<Option<IsbError>> {
    futures::future::join_all(offsets.iter().map(|offset| {
        let offset = offset.clone();
        async move { offset.ack().await.err() }
    }))
    .await
}
