//! Broker sink configuration.

use std::time::Duration;

use crate::broker::{Batching, Compression};

/// Suffix appended to the topic to form the fixed producer name.
const PRODUCER_NAME_SUFFIX: &str = "-producer";

/// Tuning knobs for a [`BrokerSink`](crate::sink::BrokerSink).
///
/// The defaults are the production settings: a 2000-message pending queue,
/// ZSTD-compressed key-based batches capped at 1000 messages or 1 MiB, and
/// a 5 second per-message deadline on the startup resync read.
#[derive(Debug, Clone)]
pub struct BrokerSinkConfig {
    /// Target topic. One topic per sink.
    pub topic: String,
    /// Bound on unacknowledged in-flight sends.
    pub max_pending_messages: usize,
    /// Batch compression.
    pub compression: Compression,
    /// Batch grouping limits.
    pub batching: Batching,
    /// Per-message read deadline during startup resync. Expiry means the
    /// tail is drained, not that the broker failed.
    pub resync_read_timeout: Duration,
}

impl BrokerSinkConfig {
    /// Creates a configuration for `topic` with production defaults.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        BrokerSinkConfig {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// The fixed producer (and resync reader) name for this topic.
    ///
    /// Reusing the same name across restarts is what lets the broker
    /// fence out a second writer.
    #[must_use]
    pub fn producer_name(&self) -> String {
        format!("{}{PRODUCER_NAME_SUFFIX}", self.topic)
    }
}

impl Default for BrokerSinkConfig {
    fn default() -> Self {
        BrokerSinkConfig {
            topic: String::new(),
            max_pending_messages: 2000,
            compression: Compression::Zstd,
            batching: Batching::default(),
            resync_read_timeout: Duration::from_secs(5),
        }
    }
}
