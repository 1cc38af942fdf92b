//! The vertex forwarder.
//!
//! The processing loop of every vertex pod: pull a batch from the inbound buffer,
//! apply the vertex transform, write the results to every outbound buffer, then ack
//! the offsets whose writes all succeeded. Messages with failed writes are left
//! unacked and redelivered by the broker once their ack wait expires, which keeps
//! delivery at-least-once end to end.

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::udf::Builtin;
use rill_isb::{BufferReader, BufferWriter, Offset};

/// The delay applied after a failed batch before reading again.
const ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

/// The forwarder driving one vertex's read → process → write → ack loop.
pub struct Forwarder {
    name: String,
    reader: Box<dyn BufferReader>,
    writers: Vec<Box<dyn BufferWriter>>,
    function: Builtin,
    batch_size: usize,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl Forwarder {
    /// Create a new instance.
    pub fn new(name: String, reader: Box<dyn BufferReader>, writers: Vec<Box<dyn BufferWriter>>, function: Builtin, batch_size: usize, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            name,
            reader,
            writers,
            function,
            batch_size,
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        tracing::debug!(vertex = %self.name, "forwarder has started");
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());
        loop {
            tokio::select! {
                batch_res = self.forward_batch() => {
                    if let Err(err) = batch_res {
                        tracing::error!(error = ?err, vertex = %self.name, "error forwarding batch");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
                _ = shutdown.next() => break,
            }
        }

        // Begin shutdown routine: in-flight unacked messages are abandoned here and
        // will be redelivered by the broker.
        if let Err(err) = self.reader.close().await {
            tracing::error!(error = %err, vertex = %self.name, "error closing buffer reader");
        }
        for writer in self.writers.iter() {
            if let Err(err) = writer.close().await {
                tracing::error!(error = %err, vertex = %self.name, "error closing buffer writer");
            }
        }
        tracing::debug!(vertex = %self.name, "forwarder has shutdown");
        Ok(())
    }

    /// Pull one batch through the transform and out to every writer.
    ///
    /// Returns the number of messages read; zero means the read timed out with the
    /// buffer empty.
    pub(crate) async fn forward_batch(&self) -> Result<usize> {
        let batch = self.reader.read(self.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        // Apply the transform. Dropped messages are processed as far as this vertex
        // is concerned, so their offsets go straight to the ack set.
        let mut to_ack: Vec<Offset> = Vec::with_capacity(count);
        let mut kept_offsets = Vec::new();
        let mut outputs = Vec::new();
        for read_message in batch {
            match self.function.apply(read_message.message) {
                Some(message) => {
                    outputs.push(message);
                    kept_offsets.push(read_message.offset);
                }
                None => to_ack.push(read_message.offset),
            }
        }

        // Fan the outputs to every writer, tracking per-message success across all
        // of them. A single poisoned message must not block its batch peers.
        let mut write_ok = vec![true; outputs.len()];
        for writer in self.writers.iter() {
            let errs = writer.write(outputs.clone()).await;
            for (idx, err) in errs.iter().enumerate() {
                if err.is_some() {
                    write_ok[idx] = false;
                }
            }
        }
        to_ack.extend(
            kept_offsets
                .into_iter()
                .zip(write_ok.iter())
                .filter(|(_, ok)| **ok)
                .map(|(offset, _)| offset),
        );

        for err in self.reader.ack(&to_ack).await.into_iter().flatten() {
            tracing::error!(error = %err, vertex = %self.name, "failed to ack message");
        }
        Ok(count)
    }
}
