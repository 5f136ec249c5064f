//! The capture session: handshake, ack routing, and forwarding.
//!
//! A session is transport-independent. [`Gateway::open_session`] performs
//! the init handshake against any stream of client requests, and
//! [`CaptureSession::run`] drives the two concurrent halves of the call:
//! the ack router (a spawned task consuming the client direction) and the
//! forwarder (the caller's task, multiplexing live changes and dump loads
//! onto the response channel). The tonic service in [`crate::service`] is
//! a thin adapter over this module, and tests drive it with channel-backed
//! streams.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tonic::Status;
use tracing::{debug, warn};

use rill_core::proto;
use rill_core::{
    Change, ChangeSource, Checkpoint, DumpInfoPuller, DumpRejected, Lsn, SourceDumper,
    SourceResolver,
};

use crate::error::GatewayError;

/// A stream of client requests, as the transport delivers them.
pub trait RequestStream:
    Stream<Item = Result<proto::CaptureRequest, Status>> + Send + Unpin + 'static
{
}

impl<S> RequestStream for S where
    S: Stream<Item = Result<proto::CaptureRequest, Status>> + Send + Unpin + 'static
{
}

/// The capture gateway: resolves upstream sources and serves capture
/// sessions over bidirectional streams.
pub struct Gateway {
    resolver: Arc<dyn SourceResolver>,
    dumper: Arc<dyn SourceDumper>,
    puller: Arc<dyn DumpInfoPuller>,
}

impl Gateway {
    /// Creates a gateway over the given collaborators.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn SourceResolver>,
        dumper: Arc<dyn SourceDumper>,
        puller: Arc<dyn DumpInfoPuller>,
    ) -> Self {
        Gateway {
            resolver,
            dumper,
            puller,
        }
    }

    /// Performs the capture handshake: receives the first client request,
    /// which must be an init message, resolves its URI, and opens the live
    /// change feed from the beginning.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InitRequired`] when the first request is not an
    /// init message; [`GatewayError::Transport`] when the stream fails
    /// before one arrives; resolver and capture failures verbatim.
    pub async fn open_session<S: RequestStream>(
        &self,
        requests: &mut S,
    ) -> Result<CaptureSession, GatewayError> {
        let first = match requests.next().await {
            Some(Ok(request)) => request,
            Some(Err(status)) => return Err(GatewayError::Transport(status)),
            None => {
                return Err(GatewayError::Transport(Status::cancelled(
                    "client closed the stream before init",
                )))
            }
        };

        let Some(proto::capture_request::Payload::Init(init)) = first.payload else {
            return Err(GatewayError::InitRequired);
        };

        let source = self.resolver.resolve(&init.uri).await?;
        let changes = source.capture(Checkpoint::ZERO).await?;
        debug!(uri = %init.uri, "capture session opened");

        Ok(CaptureSession {
            uri: init.uri,
            source,
            changes,
            dumper: Arc::clone(&self.dumper),
            puller: Arc::clone(&self.puller),
        })
    }
}

/// An open capture session: a resolved source with its live feed, ready
/// to be pumped onto a response channel.
pub struct CaptureSession {
    uri: String,
    source: Arc<dyn ChangeSource>,
    changes: mpsc::Receiver<Change>,
    dumper: Arc<dyn SourceDumper>,
    puller: Arc<dyn DumpInfoPuller>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Drives the session until either input sequence drains, the client
    /// stops receiving, or the client stream errors out from under the
    /// ack router.
    ///
    /// The router runs as a background task for the lifetime of this call
    /// and is aborted when the forwarder returns; the source is stopped on
    /// every exit path.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Disconnected`] when a send on the response channel
    /// fails. Dump-load failures are logged and swallowed.
    pub async fn run<S: RequestStream>(
        self,
        requests: S,
        out: mpsc::Sender<Result<proto::CaptureMessage, Status>>,
    ) -> Result<(), GatewayError> {
        let CaptureSession {
            uri,
            source,
            mut changes,
            dumper,
            puller,
        } = self;

        // One-slot channel: tokio has no rendezvous channel, so a single
        // ack may buffer before the router blocks on the puller.
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let mut dumps = puller.pull(&uri, ack_rx).await;

        let router = tokio::spawn(route_acks(requests, Arc::clone(&source), ack_tx));
        let result = forward(&mut changes, &mut dumps, &*dumper, &out).await;
        router.abort();
        source.stop().await;
        result
    }
}

/// Routes client acks upstream: zero checkpoints signal the dump puller,
/// non-zero checkpoints move the source cursor. Ends when the client
/// stream drains or errors.
async fn route_acks<S: RequestStream>(
    mut requests: S,
    source: Arc<dyn ChangeSource>,
    dump_acks: mpsc::Sender<rill_core::DumpAck>,
) {
    while let Some(request) = requests.next().await {
        let Ok(request) = request else { return };
        let Some(proto::capture_request::Payload::Ack(ack)) = request.payload else {
            continue;
        };
        if ack.checkpoint == 0 {
            let outcome = if ack.requeue { Err(DumpRejected) } else { Ok(()) };
            if dump_acks.send(outcome).await.is_err() {
                return;
            }
        } else if ack.requeue {
            source.requeue(Checkpoint::from(ack.checkpoint)).await;
        } else {
            source.commit(Checkpoint::from(ack.checkpoint)).await;
        }
    }
}

/// Multiplexes the live feed and dump loads onto the response channel
/// until either input drains.
async fn forward(
    changes: &mut mpsc::Receiver<Change>,
    dumps: &mut mpsc::Receiver<proto::DumpInfo>,
    dumper: &dyn SourceDumper,
    out: &mpsc::Sender<Result<proto::CaptureMessage, Status>>,
) -> Result<(), GatewayError> {
    let mut watermark = Lsn::ZERO;
    loop {
        tokio::select! {
            change = changes.recv() => {
                let Some(change) = change else { return Ok(()) };
                if let Some(row) = change.message.row() {
                    send(out, proto::CaptureMessage {
                        checkpoint: change.checkpoint.lsn.as_u64(),
                        change: Some(row.clone()),
                    })
                    .await?;
                }
                // Transaction delimiters are not forwarded but still move
                // the floor the next dump snapshots from.
                watermark = change.checkpoint.lsn;
            }
            info = dumps.recv() => {
                let Some(info) = info else { return Ok(()) };
                match dumper.load_dump(watermark, &info).await {
                    Ok(batch) => {
                        for row in batch {
                            send(out, proto::CaptureMessage {
                                checkpoint: 0,
                                change: Some(row),
                            })
                            .await?;
                        }
                    }
                    Err(error) => {
                        warn!(
                            %error,
                            schema = %info.schema,
                            table = %info.table,
                            floor = %watermark,
                            "dump load failed, dropping batch"
                        );
                    }
                }
            }
        }
    }
}

async fn send(
    out: &mpsc::Sender<Result<proto::CaptureMessage, Status>>,
    message: proto::CaptureMessage,
) -> Result<(), GatewayError> {
    out.send(Ok(message))
        .await
        .map_err(|_| GatewayError::Disconnected)
}
