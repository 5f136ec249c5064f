//! # Rill Capture Gateway
//!
//! A bidirectional streaming service that multiplexes a live change feed
//! and on-demand dump deliveries onto one client stream, while routing
//! client acknowledgements back upstream as commit/requeue cursor moves
//! or per-dump accept/reject signals.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Gateway error types and their RPC status mapping.
pub mod error;

/// Transport-independent capture sessions.
pub mod session;

/// The tonic service adapter.
pub mod service;

pub use error::GatewayError;
pub use service::{serve, CaptureService};
pub use session::{CaptureSession, Gateway};
