//! The JetStream buffer writer.

use async_nats::jetstream;
use async_trait::async_trait;

use crate::jetstream::{encode_headers, METRIC_ISB_WRITE_ERRORS};
use crate::message::Message;
use crate::{BufferWriter, IsbError};
use rill_core::names;

/// A buffer writer publishing onto one JetStream subject.
pub struct JetStreamWriter {
    name: String,
    buffer: String,
    context: jetstream::Context,
}

impl JetStreamWriter {
    /// Create a new writer against the given buffer.
    ///
    /// The target stream is looked up eagerly so a missing buffer fails at
    /// construction rather than on first write.
    pub async fn new(client: async_nats::Client, name: impl Into<String>, buffer: &str) -> Result<Self, IsbError> {
        let context = jetstream::new(client);
        let stream_name = names::jet_stream_name(buffer);
        context.get_stream(&stream_name).await.map_err(|err| IsbError::SetupFailed {
            buffer: buffer.into(),
            reason: format!("failed to look up stream {:?}: {}", stream_name, err),
        })?;
        metrics::register_counter!(METRIC_ISB_WRITE_ERRORS, metrics::Unit::Count, "the total number of inter-step buffer write errors");
        Ok(Self {
            name: name.into(),
            buffer: buffer.into(),
            context,
        })
    }

    /// Publish a single message, awaiting the broker's publish acknowledgement.
    async fn publish(&self, message: Message) -> Result<(), IsbError> {
        let headers = encode_headers(&message.header);
        let ack = self
            .context
            .publish_with_headers(self.buffer.clone(), headers, message.body.payload)
            .await
            .map_err(|err| classify_publish_error(&self.buffer, err.to_string()))?;
        ack.await.map_err(|err| classify_publish_error(&self.buffer, err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BufferWriter for JetStreamWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, messages: Vec<Message>) -> Vec<Option<IsbError>> {
        let results = futures::future::join_all(messages.into_iter().map(|message| self.publish(message))).await;
        results
            .into_iter()
            .map(|res| {
                let err = res.err();
                if let Some(err) = &err {
                    metrics::counter!(METRIC_ISB_WRITE_ERRORS, 1, "buffer" => self.name.clone());
                    tracing::error!(error = %err, buffer = %self.buffer, "failed to write message to buffer");
                }
                err
            })
            .collect()
    }

    async fn close(&self) -> Result<(), IsbError> {
        Ok(())
    }
}

/// Map a publish failure onto an ISB error, surfacing buffer-full backpressure.
///
/// Buffers are streams with limits retention and a discard-new policy, so a full
/// buffer rejects publishes with a max-messages error.
fn classify_publish_error(buffer: &str, reason: String) -> IsbError {
    if reason.contains("maximum messages exceeded") {
        IsbError::BufferFull(buffer.into())
    } else {
        IsbError::WriteFailed {
            buffer: buffer.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_buffers_surface_as_backpressure() {
        let err = classify_publish_error("test-pl.in-out", "maximum messages exceeded".into());
        assert!(matches!(err, IsbError::BufferFull(_)), "expected BufferFull, got {:?}", err);
        let err = classify_publish_error("test-pl.in-out", "no responders".into());
        assert!(matches!(err, IsbError::WriteFailed { .. }), "expected WriteFailed, got {:?}", err);
    }
}
