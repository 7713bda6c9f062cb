//! Tunables for a connection and a client.
//!
//! Both structs deserialize with serde, so a host application can embed them in
//! its own configuration file; every field has a default. Durations are given
//! in milliseconds on the serde side.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::correlation::DEFAULT_UNSOLICITED_CAPACITY;
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

/// Default upper bound for one reassembled message (50 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Default origin identity stamped on outbound requests.
pub const DEFAULT_ORIGIN: &str = "client";

/// Settings for one [`Connection`](crate::transport::Connection).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest message accepted after frame reassembly.
    pub max_message_size: usize,
    /// Writer queue capacity.
    pub channel_capacity: usize,
    /// Frames queued or in flight before senders wait.
    pub max_pending_frames: usize,
    /// How long a sender waits on a saturated queue.
    #[serde(rename = "backpressure_timeout_ms", deserialize_with = "millis")]
    pub backpressure_timeout: Duration,
    /// Buffer of the unsolicited message channel.
    pub unsolicited_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            unsolicited_capacity: DEFAULT_UNSOLICITED_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: self.backpressure_timeout,
        }
    }

    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Settings for a [`DaemonClient`](crate::DaemonClient).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity stamped as `origin` on every request.
    pub origin: String,
    /// Transport settings.
    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
