//! Sink error types.

use thiserror::Error;

use rill_core::ParseLsnError;

use crate::broker::BrokerError;

/// Errors from sink setup and apply.
///
/// Cloneable so the latched error can be handed out by
/// [`error`](crate::sink::BrokerSink::error) while staying latched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// A broker operation failed (setup, send, or resync read).
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A change arrived before any transaction begin marker.
    #[error("received incomplete transaction")]
    IncompleteTransaction,

    /// A change could not be serialized for the broker.
    #[error("change serialisation failed: {0}")]
    Serialisation(String),

    /// A broker message carried a missing or malformed `lsn` property.
    #[error("invalid lsn property on broker message: {0}")]
    Lsn(#[from] ParseLsnError),

    /// The local hostname could not be read for the producer identity.
    #[error("failed to read local hostname: {0}")]
    Hostname(String),

    /// `apply` was called before a successful `setup`.
    #[error("sink has not been set up")]
    NotReady,

    /// The sink was stopped before or during the call.
    #[error("sink is stopped")]
    Stopped,
}
