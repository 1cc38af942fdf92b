//! JetStream-backed inter-step buffers.
//!
//! Each buffer maps to one JetStream stream with a single subject (the buffer name)
//! and one durable pull consumer whose name equals the stream name. NATS stream names
//! may not contain `.`, so stream names are derived via
//! [`rill_core::names::jet_stream_name`].

mod reader;
mod writer;

use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use async_nats::HeaderMap;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::message::Header;
use crate::IsbError;

pub use reader::JetStreamReader;
pub use writer::JetStreamWriter;

/// The reserved header marking a message as a window control message, literal `"1"`.
const HEADER_WINDOW: &str = "window";
/// The reserved header carrying the message ID.
const HEADER_ID: &str = "id";
/// The reserved header carrying the message routing key.
const HEADER_KEY: &str = "key";
/// The reserved header carrying the event time in decimal milliseconds since the Unix epoch.
const HEADER_EVENT_TIME: &str = "eventTime";
/// The reserved header carrying the window start time in decimal milliseconds since the Unix epoch.
const HEADER_START_TIME: &str = "startTime";
/// The reserved header carrying the window end time in decimal milliseconds since the Unix epoch.
const HEADER_END_TIME: &str = "endTime";

pub(crate) const METRIC_ISB_READ_ERRORS: &str = "rill_isb_read_errors";
pub(crate) const METRIC_ISB_READ_TOTAL: &str = "rill_isb_read_total";
pub(crate) const METRIC_ISB_ACK_ERRORS: &str = "rill_isb_ack_errors";
pub(crate) const METRIC_ISB_WRITE_ERRORS: &str = "rill_isb_write_errors";

/// JetStream client configuration, sourced from the pod environment.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// The URL of the NATS cluster.
    pub url: String,
    /// The user to authenticate as.
    #[serde(default)]
    pub user: Option<String>,
    /// The password to authenticate with.
    #[serde(default)]
    pub password: Option<String>,
}

impl ClientConfig {
    /// Build the client config from the environment.
    pub fn from_env() -> Result<Self> {
        envy::prefixed("RILL_ISBSVC_JETSTREAM_")
            .from_env()
            .context("error building JetStream client config from env")
    }

    /// Establish the broker connection.
    ///
    /// The connection is shared by every reader, writer and heartbeat of a pod; it is
    /// owned by the caller and closed once on shutdown.
    pub async fn connect(&self) -> Result<async_nats::Client, IsbError> {
        let options = match (&self.user, &self.password) {
            (Some(user), Some(password)) => async_nats::ConnectOptions::new().user_and_password(user.clone(), password.clone()),
            _ => async_nats::ConnectOptions::new(),
        };
        options
            .connect(self.url.as_str())
            .await
            .map_err(|err| IsbError::BrokerUnavailable(err.to_string()))
    }
}

/// Options governing reader behavior.
#[derive(Clone, Debug)]
pub struct ReadOptions {
    /// The upper bound on how long a single batched read waits for messages.
    pub read_timeout: Duration,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Compute the in-progress heartbeat interval for the given server-side ack wait.
///
/// Two thirds of the ack wait guarantees at least one refresh before expiry under
/// nominal scheduling; a floor of one second keeps the broker from being flooded.
pub(crate) fn in_progress_tick_duration(ack_wait: Duration) -> Duration {
    let mut secs = (ack_wait.as_secs_f64() * 2.0 / 3.0) as u64;
    if secs < 1 {
        secs = 1;
    }
    Duration::from_secs(secs)
}

/// Encode the given message header as broker-visible headers.
pub(crate) fn encode_headers(header: &Header) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if header.is_window {
        headers.insert(HEADER_WINDOW, "1");
    }
    if !header.id.is_empty() {
        headers.insert(HEADER_ID, header.id.as_str());
    }
    if !header.key.is_empty() {
        headers.insert(HEADER_KEY, String::from_utf8_lossy(&header.key).as_ref());
    }
    if let Some(event_time) = header.event_time {
        headers.insert(HEADER_EVENT_TIME, encode_time_ms(event_time).as_str());
    }
    if let Some(start_time) = header.start_time {
        headers.insert(HEADER_START_TIME, encode_time_ms(start_time).as_str());
    }
    if let Some(end_time) = header.end_time {
        headers.insert(HEADER_END_TIME, encode_time_ms(end_time).as_str());
    }
    headers
}

/// Decode broker-visible headers back into a message header.
///
/// Absent headers decode to zero values. Malformed numeric headers decode to the Unix
/// epoch without error; the broker is the source of truth for delivery, not header
/// integrity.
pub(crate) fn decode_headers(headers: Option<&HeaderMap>) -> Header {
    let headers = match headers {
        Some(headers) => headers,
        None => return Header::default(),
    };
    let mut header = Header::default();
    if get_header(headers, HEADER_WINDOW).as_deref() == Some("1") {
        header.is_window = true;
    }
    if let Some(id) = get_header(headers, HEADER_ID) {
        header.id = id;
    }
    if let Some(key) = get_header(headers, HEADER_KEY) {
        header.key = key.into_bytes().into();
    }
    header.event_time = get_header(headers, HEADER_EVENT_TIME).map(|val| decode_time_ms(&val));
    header.start_time = get_header(headers, HEADER_START_TIME).map(|val| decode_time_ms(&val));
    header.end_time = get_header(headers, HEADER_END_TIME).map(|val| decode_time_ms(&val));
    header
}

fn get_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).map(|val| val.as_str().to_string())
}

fn encode_time_ms(time: OffsetDateTime) -> String {
    let millis = time.unix_timestamp_nanos() / 1_000_000;
    millis.to_string()
}

fn decode_time_ms(val: &str) -> OffsetDateTime {
    let millis: i128 = val.parse().unwrap_or(0);
    OffsetDateTime::from_unix_timestamp_nanos(millis * 1_000_000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
