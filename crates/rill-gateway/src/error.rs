//! Gateway error types.

use thiserror::Error;
use tonic::Status;

use rill_core::SourceError;

/// Errors that terminate a capture call.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The first client request did not carry an init message.
    #[error("the first capture request must carry an init message")]
    InitRequired,

    /// Resolver or source failure while opening the session.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The client stream failed or closed before the handshake finished.
    #[error("client transport failed: {0}")]
    Transport(Status),

    /// The client stopped receiving the response stream.
    #[error("client stopped receiving")]
    Disconnected,
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InitRequired => Status::failed_precondition(err.to_string()),
            GatewayError::Source(SourceError::Resolve { .. }) => {
                Status::invalid_argument(err.to_string())
            }
            GatewayError::Source(_) => Status::internal(err.to_string()),
            GatewayError::Transport(status) => status,
            GatewayError::Disconnected => Status::cancelled(err.to_string()),
        }
    }
}
