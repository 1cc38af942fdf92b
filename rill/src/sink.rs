//! The built-in log sink.

use async_trait::async_trait;

use rill_isb::{BufferWriter, IsbError, Message};

/// A writer which terminates a pipeline by logging payloads.
pub struct LogWriter {
    name: String,
}

impl LogWriter {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

#[async_trait]
impl BufferWriter for LogWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, messages: Vec<Message>) -> Vec<Option<IsbError>> {
        messages
            .into_iter()
            .map(|message| {
                tracing::info!(
                    sink = %self.name,
                    id = %message.header.id,
                    payload = %String::from_utf8_lossy(&message.body.payload),
                    "message received at log sink",
                );
                None
            })
            .collect()
    }

    async fn close(&self) -> Result<(), IsbError> {
        Ok(())
    }
}
