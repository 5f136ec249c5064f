//! # Rill Core
//!
//! Shared model for the Rill change-data-capture pipeline: the wire
//! protocol, LSN checkpoints, and the trait seams behind which upstream
//! sources, resolvers, dump pullers, and dumpers live.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Generated protobuf types and the capture gateway service.
pub mod proto {
    #![allow(clippy::all, clippy::pedantic, missing_docs)]
    tonic::include_proto!("rill.v1");
}

/// LSN positions and checkpoint carriers.
pub mod checkpoint;

/// The native change event and payload accessors.
pub mod change;

/// Collaborator traits: change sources, resolvers, dump pullers, dumpers.
pub mod source;

/// Reusable in-memory collaborators for tests.
pub mod testing;

pub use change::Change;
pub use checkpoint::{Checkpoint, Lsn, ParseLsnError};
pub use source::{
    ChangeSource, DumpAck, DumpInfoPuller, DumpRejected, SourceDumper, SourceError, SourceResolver,
};
