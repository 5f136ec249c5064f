//! The broker client seam.
//!
//! The sink drives a distributed message broker through these traits
//! rather than a concrete client, so the broker stays a collaborator: any
//! backend offering named exclusive producers, caller-assigned sequence
//! ids, and tail readers can sit behind them. [`memory`] provides the
//! in-process implementation used by tests.

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from the broker seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker is unreachable or refused the connection.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The topic already has an exclusive producer.
    #[error("exclusive producer '{0}' is already attached to the topic")]
    ProducerInUse(String),

    /// No message arrived within the read deadline.
    #[error("read deadline exceeded")]
    DeadlineExceeded,

    /// The broker rejected or lost a published message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The client, producer, or reader has been closed.
    #[error("broker handle is closed")]
    Closed,
}

/// Compression applied to producer batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    #[default]
    None,
    /// LZ4 frame compression.
    Lz4,
    /// Zstandard compression.
    Zstd,
}

/// How a producer claims its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Any number of producers may attach.
    #[default]
    Shared,
    /// The broker rejects a second producer on the topic.
    Exclusive,
}

/// Batch grouping limits for a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batching {
    /// Group records sharing a key into the same batch, so one
    /// transaction lands contiguously in one partition.
    pub key_based: bool,
    /// Maximum records per batch.
    pub max_messages: usize,
    /// Maximum batch size in bytes.
    pub max_bytes: usize,
}

impl Default for Batching {
    fn default() -> Self {
        Batching {
            key_based: true,
            max_messages: 1000,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Options for creating a [`TopicProducer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerOptions {
    /// Target topic.
    pub topic: String,
    /// Producer name. Under [`AccessMode::Exclusive`] this is the
    /// correctness primitive: reusing the name across restarts is what
    /// prevents split-brain writers.
    pub name: String,
    /// How the producer claims the topic.
    pub access_mode: AccessMode,
    /// Producer-level properties stamped on the attachment (e.g. `host`).
    pub properties: HashMap<String, String>,
    /// Bound on unacknowledged in-flight sends; `send` blocks at the cap.
    pub max_pending_messages: usize,
    /// Batch compression.
    pub compression: Compression,
    /// Batch grouping limits.
    pub batching: Batching,
}

/// Where a reader starts on the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// The first retained message.
    Earliest,
    /// The last message on the topic.
    #[default]
    Latest,
}

/// Options for creating a [`TopicReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Topic to read.
    pub topic: String,
    /// Reader name, for broker-side bookkeeping.
    pub name: String,
    /// Start position.
    pub start: StartPosition,
    /// Whether the message at the start position itself is delivered.
    pub start_inclusive: bool,
}

/// A message submitted to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMessage {
    /// Partitioning and batching key.
    pub key: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Per-message properties.
    pub properties: HashMap<String, String>,
    /// Caller-assigned sequence id, strictly increasing per partition.
    pub sequence_id: i64,
}

/// A message delivered by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderMessage {
    /// Partitioning key, if the message carried one.
    pub key: Option<String>,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Per-message properties.
    pub properties: HashMap<String, String>,
    /// The sequence id the producer assigned.
    pub sequence_id: i64,
}

/// Broker-assigned identifier of a durably stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u64);

/// Resolves once the broker durably acknowledges (or rejects) a send.
pub type SendReceipt = oneshot::Receiver<Result<MessageId, BrokerError>>;

/// A connection to the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Attaches a reader to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] on a closed client, or a
    /// connection error from the broker.
    async fn create_reader(&self, options: ReaderOptions) -> Result<Box<dyn TopicReader>, BrokerError>;

    /// Attaches a producer to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ProducerInUse`] when an exclusive claim is
    /// already held, or [`BrokerError::Closed`] on a closed client.
    async fn create_producer(
        &self,
        options: ProducerOptions,
    ) -> Result<Box<dyn TopicProducer>, BrokerError>;

    /// Releases the connection.
    async fn close(&self);
}

/// A reader positioned on a topic.
#[async_trait]
pub trait TopicReader: Send {
    /// Whether a message is currently available at the read position.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the broker cannot answer.
    async fn has_next(&mut self) -> Result<bool, BrokerError>;

    /// Reads the next message, waiting at most `read_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeadlineExceeded`] when no message arrives
    /// in time — the signal that the tail has been drained — and other
    /// variants for transport failures.
    async fn next(&mut self, read_timeout: Duration) -> Result<ReaderMessage, BrokerError>;

    /// Releases the reader.
    async fn close(&mut self);
}

/// A producer attached to a topic.
#[async_trait]
pub trait TopicProducer: Send + Sync {
    /// Enqueues a message. Waits for a pending-queue slot when the
    /// in-flight cap is reached, but never for the broker round-trip; the
    /// returned receipt resolves on the durable ack.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] on a closed producer.
    async fn send(&self, message: ProducerMessage) -> Result<SendReceipt, BrokerError>;

    /// Waits for every in-flight send to be acknowledged.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the broker connection drops while
    /// draining.
    async fn flush(&self) -> Result<(), BrokerError>;

    /// Releases the producer and its topic claim.
    async fn close(&self);
}
