//! The JetStream buffer reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::jetstream::{decode_headers, in_progress_tick_duration, ReadOptions, METRIC_ISB_ACK_ERRORS, METRIC_ISB_READ_ERRORS, METRIC_ISB_READ_TOTAL};
use crate::message::{Body, Message, ReadMessage};
use crate::{AckOffset, BufferReader, IsbError};
use rill_core::names;

/// A buffer reader bound to one durable JetStream pull consumer.
///
/// The consumer name equals the stream name; the server-configured ack wait drives
/// the in-progress heartbeat interval of delivered messages.
pub struct JetStreamReader {
    name: String,
    buffer: String,
    consumer: PullConsumer,
    opts: ReadOptions,
    in_progress_tick: Duration,
    /// Closing the reader fans out to every outstanding heartbeat task.
    close_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl JetStreamReader {
    /// Create a new reader against the given buffer.
    pub async fn new(client: async_nats::Client, name: impl Into<String>, buffer: &str, opts: ReadOptions) -> Result<Self, IsbError> {
        let name = name.into();
        let stream_name = names::jet_stream_name(buffer);
        let context = jetstream::new(client);
        let stream = context.get_stream(&stream_name).await.map_err(|err| IsbError::SetupFailed {
            buffer: buffer.into(),
            reason: format!("failed to look up stream {:?}: {}", stream_name, err),
        })?;
        let mut consumer: PullConsumer = stream.get_consumer(&stream_name).await.map_err(|err| IsbError::SetupFailed {
            buffer: buffer.into(),
            reason: format!("failed to bind pull consumer {:?}: {}", stream_name, err),
        })?;
        let ack_wait = consumer
            .info()
            .await
            .map_err(|err| IsbError::SetupFailed {
                buffer: buffer.into(),
                reason: format!("failed to get consumer info: {}", err),
            })?
            .config
            .ack_wait;
        // If ack wait is 3s, ticks every 2s.
        let in_progress_tick = in_progress_tick_duration(ack_wait);

        metrics::register_counter!(METRIC_ISB_READ_TOTAL, metrics::Unit::Count, "the total number of messages read from inter-step buffers");
        metrics::register_counter!(METRIC_ISB_READ_ERRORS, metrics::Unit::Count, "the total number of inter-step buffer read errors");
        metrics::register_counter!(METRIC_ISB_ACK_ERRORS, metrics::Unit::Count, "the total number of inter-step buffer ack errors");

        let (close_tx, _) = broadcast::channel(1);
        Ok(Self {
            name,
            buffer: buffer.into(),
            consumer,
            opts,
            in_progress_tick,
            close_tx,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BufferReader for JetStreamReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, count: usize) -> Result<Vec<ReadMessage>, IsbError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(count)
            .expires(self.opts.read_timeout)
            .messages()
            .await
            .map_err(|err| {
                metrics::counter!(METRIC_ISB_READ_ERRORS, 1, "buffer" => self.name.clone());
                IsbError::FetchFailed {
                    buffer: self.buffer.clone(),
                    reason: err.to_string(),
                }
            })?;

        // An exhausted batch is how the server signals a read timeout; only failed
        // deliveries within the batch are errors.
        let mut result = Vec::with_capacity(count);
        while let Some(delivery) = batch.next().await {
            let msg = match delivery {
                Ok(msg) => msg,
                Err(err) => {
                    metrics::counter!(METRIC_ISB_READ_ERRORS, 1, "buffer" => self.name.clone());
                    return Err(IsbError::FetchFailed {
                        buffer: self.buffer.clone(),
                        reason: err.to_string(),
                    });
                }
            };
            let header = decode_headers(msg.headers.as_ref());
            let payload = msg.payload.clone();
            let offset = JetStreamOffset::new(msg, self.in_progress_tick, &self.close_tx);
            result.push(ReadMessage {
                message: Message {
                    header,
                    body: Body { payload },
                },
                offset: Arc::new(offset),
            });
        }
        metrics::counter!(METRIC_ISB_READ_TOTAL, result.len() as u64, "buffer" => self.name.clone());
        Ok(result)
    }

    async fn close(&self) -> Result<(), IsbError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Stop every outstanding heartbeat; unacked messages are abandoned and
            // will be redelivered by the broker once their ack wait expires.
            let _res = self.close_tx.send(());
        }
        Ok(())
    }
}

/// The offset of one delivered JetStream message.
pub struct JetStreamOffset {
    seq: u64,
    msg: Arc<jetstream::Message>,
    acked: AtomicBool,
    /// The cancellation handle of the heartbeat task, taken on ack.
    heartbeat: Mutex<Option<oneshot::Sender<()>>>,
}

impl JetStreamOffset {
    fn new(msg: jetstream::Message, tick: Duration, close_tx: &broadcast::Sender<()>) -> Self {
        let seq = msg.info().map(|info| info.stream_sequence).unwrap_or(0);
        let msg = Arc::new(msg);
        // A tick of 1s means ack wait is 1s or 2s; refreshing that aggressively does
        // not make much sense, increasing ack wait is recommended instead.
        let heartbeat = if tick > Duration::from_secs(1) {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            tokio::spawn(work_in_progress(msg.clone(), seq, tick, cancel_rx, close_tx.subscribe()));
            Some(cancel_tx)
        } else {
            None
        };
        Self {
            seq,
            msg,
            acked: AtomicBool::new(false),
            heartbeat: Mutex::new(heartbeat),
        }
    }
}

impl std::fmt::Display for JetStreamOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.seq)
    }
}

#[async_trait]
impl AckOffset for JetStreamOffset {
    fn sequence(&self) -> u64 {
        self.seq
    }

    async fn ack(&self) -> Result<(), IsbError> {
        // Cancel the heartbeat before the broker round-trip so no tick races the ack.
        if let Some(cancel_tx) = self.heartbeat.lock().await.take() {
            let _res = cancel_tx.send(());
        }
        if self.acked.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.msg.double_ack().await {
            // An already-acked or missing message has nothing left to settle; a tick
            // that was in flight when the cancel landed may have raced this ack at
            // the broker. Both coerce to success.
            let reason = err.to_string();
            if !is_already_settled(&reason) {
                metrics::counter!(METRIC_ISB_ACK_ERRORS, 1);
                tracing::error!(error = %err, seq = self.seq, "failed to ack message");
                return Err(IsbError::AckFailed { seq: self.seq, reason });
            }
        }
        self.acked.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Check if an ack or in-progress error means the message was already acked or is no
/// longer known to the broker. Repeated and late acks must return success.
fn is_already_settled(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("already acked") || reason.contains("already acknowledged") || reason.contains("message not found") || reason.contains("no message found")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn already_settled_errors_coerce_to_success() {
        assert!(is_already_settled("message was already acked"));
        assert!(is_already_settled("Message Already Acknowledged"));
        assert!(is_already_settled("message not found"));
        assert!(is_already_settled("no message found for sequence 7"));
        assert!(!is_already_settled("timed out waiting for ack response"));
        assert!(!is_already_settled("no responders"));
    }
}

/// Periodically mark the given message as in progress, resetting its ack wait.
///
/// The task ends when the offset is acked, when the owning reader closes, or when the
/// offset is dropped without an ack (the cancel sender is dropped with it).
async fn work_in_progress(msg: Arc<jetstream::Message>, seq: u64, tick: Duration, mut cancel_rx: oneshot::Receiver<()>, mut close_rx: broadcast::Receiver<()>) {
    let start = tokio::time::Instant::now() + tick;
    let mut ticker = tokio::time::interval_at(start, tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tracing::debug!(seq, "marking message processing as in progress");
                if let Err(err) = msg.ack_with(AckKind::Progress).await {
                    // A message acked concurrently is expected and silent; the broker
                    // stays authoritative either way.
                    if !is_already_settled(&err.to_string()) {
                        tracing::error!(error = %err, seq, "failed to set message in progress");
                    }
                }
            }
            _ = &mut cancel_rx => return,
            _ = close_rx.recv() => return,
        }
    }
}
