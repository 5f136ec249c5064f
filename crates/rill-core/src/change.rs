//! The native change event flowing through pipeline channels.

use crate::checkpoint::Checkpoint;
use crate::proto;

/// A decoded event from the upstream source: a position plus the wire
/// message carried at that position.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Position of this event in the replication stream.
    pub checkpoint: Checkpoint,
    /// The decoded payload: a transaction delimiter or a row change.
    pub message: proto::Message,
}

impl Change {
    /// Creates a change at the given checkpoint.
    #[must_use]
    pub fn new(checkpoint: Checkpoint, message: proto::Message) -> Self {
        Change {
            checkpoint,
            message,
        }
    }
}

impl proto::Message {
    /// Wraps a transaction-open marker.
    #[must_use]
    pub fn from_begin(begin: proto::Begin) -> Self {
        proto::Message {
            payload: Some(proto::message::Payload::Begin(begin)),
        }
    }

    /// Wraps a transaction-close marker.
    #[must_use]
    pub fn from_commit(commit: proto::Commit) -> Self {
        proto::Message {
            payload: Some(proto::message::Payload::Commit(commit)),
        }
    }

    /// Wraps a row change.
    #[must_use]
    pub fn from_row(row: proto::RowChange) -> Self {
        proto::Message {
            payload: Some(proto::message::Payload::Row(row)),
        }
    }

    /// The transaction-open marker, if this message is one.
    #[must_use]
    pub fn begin(&self) -> Option<&proto::Begin> {
        match &self.payload {
            Some(proto::message::Payload::Begin(begin)) => Some(begin),
            _ => None,
        }
    }

    /// The transaction-close marker, if this message is one.
    #[must_use]
    pub fn commit(&self) -> Option<&proto::Commit> {
        match &self.payload {
            Some(proto::message::Payload::Commit(commit)) => Some(commit),
            _ => None,
        }
    }

    /// The row change, if this message carries one.
    #[must_use]
    pub fn row(&self) -> Option<&proto::RowChange> {
        match &self.payload {
            Some(proto::message::Payload::Row(row)) => Some(row),
            _ => None,
        }
    }
}
