//! Collaborator traits at the upstream seam.
//!
//! The pipeline core never talks to a database directly. It consumes these
//! traits: a [`ChangeSource`] yields the live change feed and accepts
//! commit/requeue cursor movements, a [`SourceResolver`] maps a connection
//! URI to a source, a [`DumpInfoPuller`] yields dump descriptors gated by
//! per-dump acknowledgements, and a [`SourceDumper`] loads the row batch
//! for one descriptor.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::change::Change;
use crate::checkpoint::{Checkpoint, Lsn};
use crate::proto;

/// Errors from the upstream seam.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The resolver could not map a URI to a source.
    #[error("source resolve failed for '{uri}': {reason}")]
    Resolve {
        /// The URI that failed to resolve.
        uri: String,
        /// Why it failed.
        reason: String,
    },

    /// Opening the live change feed failed.
    #[error("capture failed: {reason}")]
    Capture {
        /// Why the feed could not be opened.
        reason: String,
    },

    /// Loading a dump batch failed.
    #[error("dump load failed: {reason}")]
    Dump {
        /// Why the batch could not be loaded.
        reason: String,
    },

    /// Catch-all for wrapped implementor errors.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// The client rejected a delivered dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client rejected the dump")]
pub struct DumpRejected;

/// Outcome of one dump delivery as reported by the client: `Ok(())` when
/// the client accepted it, `Err(DumpRejected)` when it could not take it.
pub type DumpAck = Result<(), DumpRejected>;

/// A live feed of decoded changes with a movable upstream cursor.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Opens the change feed starting from `from`. The feed ends when the
    /// source drains or [`stop`](ChangeSource::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Capture`] when the feed cannot be opened.
    async fn capture(&self, from: Checkpoint) -> Result<mpsc::Receiver<Change>, SourceError>;

    /// Advances the upstream cursor: everything up to `checkpoint` is done.
    async fn commit(&self, checkpoint: Checkpoint);

    /// Rolls the upstream cursor back to `checkpoint`.
    async fn requeue(&self, checkpoint: Checkpoint);

    /// Releases the feed and any upstream resources.
    async fn stop(&self);
}

/// Maps a connection URI to a [`ChangeSource`].
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolves `uri` to a source instance.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Resolve`] when the URI is unknown or the
    /// source cannot be reached.
    async fn resolve(&self, uri: &str) -> Result<Arc<dyn ChangeSource>, SourceError>;
}

/// Yields dump descriptors for regions the live stream cannot backfill.
///
/// The puller owns the pacing: it consumes `acks` to gate how many dumps
/// are outstanding at once. The returned feed ends when the puller has no
/// more regions or the ack channel closes.
#[async_trait]
pub trait DumpInfoPuller: Send + Sync {
    /// Starts pulling dump descriptors for `uri`.
    async fn pull(
        &self,
        uri: &str,
        acks: mpsc::Receiver<DumpAck>,
    ) -> mpsc::Receiver<proto::DumpInfo>;
}

/// Loads the finite row batch for one dump descriptor.
#[async_trait]
pub trait SourceDumper: Send + Sync {
    /// Loads the rows of `info` as of a snapshot no older than `min_lsn`,
    /// so the dump cannot shadow live rows already streamed past it.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Dump`] when the batch cannot be loaded.
    async fn load_dump(
        &self,
        min_lsn: Lsn,
        info: &proto::DumpInfo,
    ) -> Result<Vec<proto::RowChange>, SourceError>;
}
