//! The built-in generator source.
//!
//! Source vertices have no inbound buffer; the generator synthesizes paced batches
//! behind the same [`BufferReader`] contract the broker-backed readers implement, so
//! the forwarder needs no special casing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use rill_core::crd::GeneratorSource;
use rill_isb::message::{Body, Header, Message, ReadMessage};
use rill_isb::{AckOffset, BufferReader, IsbError};

const DEFAULT_RPU: u64 = 5;
const DEFAULT_DURATION_SECONDS: u64 = 1;
const DEFAULT_MSG_SIZE: u32 = 8;

/// A reader which generates messages at a fixed rate.
pub struct GeneratorReader {
    name: String,
    rpu: u64,
    interval: Duration,
    msg_size: u32,
    seq: AtomicU64,
}

impl GeneratorReader {
    pub fn new(name: String, spec: GeneratorSource) -> Self {
        Self {
            name,
            rpu: spec.rpu.unwrap_or(DEFAULT_RPU),
            interval: Duration::from_secs(spec.duration_seconds.unwrap_or(DEFAULT_DURATION_SECONDS)),
            msg_size: spec.msg_size.unwrap_or(DEFAULT_MSG_SIZE),
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl BufferReader for GeneratorReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, count: usize) -> Result<Vec<ReadMessage>, IsbError> {
        // Pace generation: one batch per interval.
        tokio::time::sleep(self.interval).await;
        let now = OffsetDateTime::now_utc();
        let batch = count.min(self.rpu as usize);
        let mut result = Vec::with_capacity(batch);
        for _ in 0..batch {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            result.push(ReadMessage {
                message: Message {
                    header: Header {
                        id: format!("{}-{}", self.name, seq),
                        event_time: Some(now),
                        ..Default::default()
                    },
                    body: Body {
                        payload: vec![b'0'; self.msg_size as usize].into(),
                    },
                },
                offset: Arc::new(GeneratedOffset { seq }),
            });
        }
        Ok(result)
    }

    async fn close(&self) -> Result<(), IsbError> {
        Ok(())
    }
}

/// The offset of a generated message; there is no broker to ack against.
pub struct GeneratedOffset {
    seq: u64,
}

impl std::fmt::Display for GeneratedOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.seq)
    }
}

#[async_trait]
impl AckOffset for GeneratedOffset {
    fn sequence(&self) -> u64 {
        self.seq
    }

    async fn ack(&self) -> Result<(), IsbError> {
        Ok(())
    }
}
