use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::forwarder::Forwarder;
use crate::source::GeneratorReader;
use crate::udf::Builtin;
use rill_core::crd::GeneratorSource;
use rill_isb::message::{Message, ReadMessage};
use rill_isb::{AckOffset, BufferReader, BufferWriter, IsbError, Offset};

/// An offset tracking how often it was acked.
struct RecordingOffset {
    seq: u64,
    acks: AtomicUsize,
}

impl RecordingOffset {
    fn new(seq: u64) -> Arc<Self> {
        Arc::new(Self {
            seq,
            acks: AtomicUsize::new(0),
        })
    }

    fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for RecordingOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.seq)
    }
}

#[async_trait]
impl AckOffset for RecordingOffset {
    fn sequence(&self) -> u64 {
        self.seq
    }

    async fn ack(&self) -> Result<(), IsbError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A reader serving pre-loaded batches.
struct ListReader {
    batches: Mutex<VecDeque<Vec<ReadMessage>>>,
}

#[async_trait]
impl BufferReader for ListReader {
    fn name(&self) -> &str {
        "list-reader"
    }

    async fn read(&self, _count: usize) -> Result<Vec<ReadMessage>, IsbError> {
        Ok(self.batches.lock().expect("poisoned batches lock").pop_front().unwrap_or_default())
    }

    async fn close(&self) -> Result<(), IsbError> {
        Ok(())
    }
}

/// A writer which records written message IDs and rejects one poisoned ID.
struct SelectiveWriter {
    written: Mutex<Vec<String>>,
    poison: Option<String>,
}

#[async_trait]
impl BufferWriter for SelectiveWriter {
    fn name(&self) -> &str {
        "selective-writer"
    }

    async fn write(&self, messages: Vec<Message>) -> Vec<Option<IsbError>> {
        messages
            .into_iter()
            .map(|message| {
                if Some(&message.header.id) == self.poison.as_ref() {
                    return Some(IsbError::WriteFailed {
                        buffer: "test-buffer".into(),
                        reason: "poisoned".into(),
                    });
                }
                self.written.lock().expect("poisoned written lock").push(message.header.id);
                None
            })
            .collect()
    }

    async fn close(&self) -> Result<(), IsbError> {
        Ok(())
    }
}

fn read_message(id: &str, payload: &[u8], offset: Arc<RecordingOffset>) -> ReadMessage {
    ReadMessage {
        message: Message::new(id, payload.to_vec()),
        offset: offset as Offset,
    }
}

fn forwarder_with(batch: Vec<ReadMessage>, writers: Vec<Box<dyn BufferWriter>>, function: Builtin) -> Forwarder {
    let reader = Box::new(ListReader {
        batches: Mutex::new(VecDeque::from(vec![batch])),
    });
    let (shutdown_tx, _) = broadcast::channel(1);
    Forwarder::new("test-vertex".into(), reader, writers, function, 10, shutdown_tx)
}

#[tokio::test]
async fn failed_writes_withhold_acks_without_blocking_peers() {
    let offsets = vec![RecordingOffset::new(1), RecordingOffset::new(2), RecordingOffset::new(3)];
    let batch = vec![
        read_message("m1", b"a", offsets[0].clone()),
        read_message("m2", b"b", offsets[1].clone()),
        read_message("m3", b"c", offsets[2].clone()),
    ];
    let writer = Box::new(SelectiveWriter {
        written: Mutex::new(vec![]),
        poison: Some("m2".into()),
    });

    let forwarder = forwarder_with(batch, vec![writer], Builtin::Cat);
    let count = forwarder.forward_batch().await.expect("expected the batch to forward");
    assert_eq!(count, 3);
    assert_eq!(offsets[0].ack_count(), 1, "m1 wrote cleanly and must be acked");
    assert_eq!(offsets[1].ack_count(), 0, "m2 failed to write and must be left for redelivery");
    assert_eq!(offsets[2].ack_count(), 1, "m3 wrote cleanly and must be acked");
}

#[tokio::test]
async fn filtered_messages_are_acked_but_not_written() {
    let offsets = vec![RecordingOffset::new(1), RecordingOffset::new(2)];
    let batch = vec![read_message("m1", b"", offsets[0].clone()), read_message("m2", b"data", offsets[1].clone())];
    let writer = SelectiveWriter {
        written: Mutex::new(vec![]),
        poison: None,
    };
    let writer = Box::new(writer);

    let forwarder = forwarder_with(batch, vec![writer], Builtin::Filter);
    let count = forwarder.forward_batch().await.expect("expected the batch to forward");
    assert_eq!(count, 2);
    assert_eq!(offsets[0].ack_count(), 1, "the filtered message is processed and must be acked");
    assert_eq!(offsets[1].ack_count(), 1);
}

#[tokio::test]
async fn an_empty_read_is_not_an_error() {
    let forwarder = forwarder_with(
        vec![],
        vec![Box::new(SelectiveWriter {
            written: Mutex::new(vec![]),
            poison: None,
        })],
        Builtin::Cat,
    );
    let count = forwarder.forward_batch().await.expect("an empty read must not be an error");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn generator_source_feeds_the_forwarder() {
    let reader = GeneratorReader::new(
        "input".into(),
        GeneratorSource {
            rpu: Some(3),
            duration_seconds: Some(0),
            msg_size: Some(4),
        },
    );
    let batch = reader.read(10).await.expect("expected generated messages");
    assert_eq!(batch.len(), 3, "the generator is bounded by rpu");
    for read_message in batch.iter() {
        assert_eq!(read_message.message.body.payload.len(), 4);
        assert!(read_message.message.header.event_time.is_some());
    }
    let batch = reader.read(2).await.expect("expected generated messages");
    assert_eq!(batch.len(), 2, "the generator is bounded by the requested count");
}
