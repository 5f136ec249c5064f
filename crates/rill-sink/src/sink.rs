//! The broker sink: startup resync, keyed and sequenced submission, and
//! ordered committed signalling.
//!
//! [`BrokerSink::setup`] resynchronises against the topic tail and claims
//! the exclusive producer; [`BrokerSink::apply`] consumes a change feed
//! and yields durably acknowledged checkpoints. The apply loop and the
//! receipt-completion task share a latched error and stop flag, so a
//! failure on either side stops the whole sink exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message as _;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use rill_core::{Change, Checkpoint, Lsn};

use crate::broker::{
    AccessMode, BrokerClient, BrokerError, ProducerMessage, ProducerOptions, ReaderOptions,
    SendReceipt, StartPosition, TopicProducer, TopicReader,
};
use crate::config::BrokerSinkConfig;
use crate::error::SinkError;

/// Per-message property carrying the human-readable LSN, read back by the
/// next startup resync.
pub const LSN_PROPERTY: &str = "lsn";

/// Producer-level property naming the producing host.
pub const HOST_PROPERTY: &str = "host";

/// Sink lifecycle, strictly forward-moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SinkState {
    /// Constructed, not yet resynchronised.
    New,
    /// Setup succeeded; the exclusive producer is attached.
    Ready,
    /// An apply loop is consuming changes.
    Running,
    /// Draining: no new submissions are accepted.
    Stopping,
    /// Producer flushed and closed, client closed.
    Closed,
}

struct Shared {
    error: Mutex<Option<SinkError>>,
    stopped: AtomicBool,
    stop_notify: Notify,
    state: Mutex<SinkState>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            error: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            state: Mutex::new(SinkState::New),
        })
    }

    fn state(&self) -> SinkState {
        *self.state.lock()
    }

    fn advance(&self, next: SinkState) {
        let mut state = self.state.lock();
        if next > *state {
            *state = next;
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.advance(SinkState::Stopping);
            self.stop_notify.notify_waiters();
        }
    }

    /// Latches the first error and stops the sink.
    fn fail(&self, error: SinkError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.stop();
    }

    fn error(&self) -> Option<SinkError> {
        self.error.lock().clone()
    }

    async fn wait_stopped(&self) {
        loop {
            let stopped = self.stop_notify.notified();
            tokio::pin!(stopped);
            // Register before the flag check so a stop racing in between
            // still wakes us.
            stopped.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            stopped.await;
        }
    }
}

/// Cloneable control handle over a running sink.
#[derive(Clone)]
pub struct SinkHandle {
    shared: Arc<Shared>,
}

impl SinkHandle {
    /// Stops the sink; the committed sequence ends after the drain.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// The latched error, if the sink failed.
    #[must_use]
    pub fn error(&self) -> Option<SinkError> {
        self.shared.error()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SinkState {
        self.shared.state()
    }
}

/// Writes committed transactional changes to one broker topic under
/// exclusive-producer discipline.
pub struct BrokerSink {
    config: BrokerSinkConfig,
    client: Option<Box<dyn BrokerClient>>,
    producer: Option<Box<dyn TopicProducer>>,
    shared: Arc<Shared>,
}

impl BrokerSink {
    /// Creates a sink over a broker client.
    #[must_use]
    pub fn new(client: Box<dyn BrokerClient>, config: BrokerSinkConfig) -> Self {
        BrokerSink {
            config,
            client: Some(client),
            producer: None,
            shared: Shared::new(),
        }
    }

    /// A control handle usable from other tasks.
    #[must_use]
    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SinkState {
        self.shared.state()
    }

    /// Stops the sink; the committed sequence ends after the drain.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// The latched error, if the sink failed.
    #[must_use]
    pub fn error(&self) -> Option<SinkError> {
        self.shared.error()
    }

    /// Prepares durable state: drains the topic tail to find the resume
    /// point, then claims the exclusive producer.
    ///
    /// # Errors
    ///
    /// [`SinkError::Broker`] on reader/producer failures — notably
    /// [`BrokerError::ProducerInUse`] when another sink holds the topic;
    /// [`SinkError::Lsn`] when a tail message carries a malformed `lsn`
    /// property.
    pub async fn setup(&mut self) -> Result<Checkpoint, SinkError> {
        if self.shared.is_stopped() {
            return Err(self.shared.error().unwrap_or(SinkError::Stopped));
        }
        let client = self.client.as_ref().ok_or(SinkError::NotReady)?;
        let name = self.config.producer_name();

        let mut reader = client
            .create_reader(ReaderOptions {
                topic: self.config.topic.clone(),
                name: name.clone(),
                start: StartPosition::Latest,
                start_inclusive: true,
            })
            .await?;
        let resumed = resync_tail(reader.as_mut(), self.config.resync_read_timeout).await;
        reader.close().await;
        let checkpoint = resumed?;

        let host = hostname::get()
            .map_err(|err| SinkError::Hostname(err.to_string()))?
            .to_string_lossy()
            .into_owned();

        let producer = client
            .create_producer(ProducerOptions {
                topic: self.config.topic.clone(),
                name,
                access_mode: AccessMode::Exclusive,
                properties: HashMap::from([(HOST_PROPERTY.to_string(), host)]),
                max_pending_messages: self.config.max_pending_messages,
                compression: self.config.compression,
                batching: self.config.batching.clone(),
            })
            .await?;
        self.producer = Some(producer);
        self.shared.advance(SinkState::Ready);
        debug!(topic = %self.config.topic, resume = %checkpoint, "sink ready");
        Ok(checkpoint)
    }

    /// Consumes the change feed, emitting every change to the broker and
    /// yielding each checkpoint once the broker has durably acknowledged
    /// it. The returned sequence ends when the feed drains, the sink is
    /// stopped, or an error is latched; teardown then flushes and closes
    /// the producer and the client.
    ///
    /// # Errors
    ///
    /// The latched error when the sink was already stopped, or
    /// [`SinkError::NotReady`] before a successful [`setup`](Self::setup).
    pub fn apply(
        &mut self,
        changes: mpsc::Receiver<Change>,
    ) -> Result<mpsc::Receiver<Checkpoint>, SinkError> {
        if self.shared.is_stopped() {
            return Err(self.shared.error().unwrap_or(SinkError::Stopped));
        }
        let producer = self.producer.take().ok_or(SinkError::NotReady)?;
        let client = self.client.take().ok_or(SinkError::NotReady)?;
        self.shared.advance(SinkState::Running);

        let (committed_tx, committed_rx) = mpsc::channel(self.config.max_pending_messages.max(1));
        // Bounded in practice by the producer's pending-queue cap.
        let (receipt_tx, receipt_rx) = mpsc::unbounded_channel();

        tokio::spawn(complete_receipts(
            receipt_rx,
            committed_tx,
            Arc::clone(&self.shared),
        ));
        tokio::spawn(run_apply(
            changes,
            producer,
            client,
            receipt_tx,
            Arc::clone(&self.shared),
        ));
        Ok(committed_rx)
    }
}

/// Drains whatever already sits at the topic tail, keeping the last
/// message's `lsn` property as the resume point. A read deadline means
/// "no more messages yet"; any other error is fatal.
async fn resync_tail(
    reader: &mut dyn TopicReader,
    read_timeout: Duration,
) -> Result<Checkpoint, SinkError> {
    let mut checkpoint = Checkpoint::ZERO;
    while reader.has_next().await? {
        match reader.next(read_timeout).await {
            Ok(message) => {
                let raw = message
                    .properties
                    .get(LSN_PROPERTY)
                    .map_or("", String::as_str);
                let lsn: Lsn = raw.parse()?;
                checkpoint = Checkpoint::new(lsn);
            }
            Err(BrokerError::DeadlineExceeded) => break,
            Err(error) => return Err(error.into()),
        }
    }
    Ok(checkpoint)
}

async fn run_apply(
    mut changes: mpsc::Receiver<Change>,
    producer: Box<dyn TopicProducer>,
    client: Box<dyn BrokerClient>,
    receipts: mpsc::UnboundedSender<(Checkpoint, SendReceipt)>,
    shared: Arc<Shared>,
) {
    let mut xid: Option<String> = None;
    loop {
        tokio::select! {
            () = shared.wait_stopped() => break,
            change = changes.recv() => {
                let Some(change) = change else { break };
                if let Err(error) = submit(producer.as_ref(), &mut xid, change, &receipts).await {
                    shared.fail(error);
                    break;
                }
            }
        }
    }
    shared.stop();
    drop(receipts);

    if let Err(error) = producer.flush().await {
        warn!(%error, "producer flush failed during teardown");
    }
    producer.close().await;
    client.close().await;
    shared.advance(SinkState::Closed);
    debug!("sink closed");
}

/// Serializes one change and hands it to the producer: key is the current
/// transaction id, sequence id is the LSN, and the `lsn` property carries
/// the canonical rendering for the next resync.
async fn submit(
    producer: &dyn TopicProducer,
    xid: &mut Option<String>,
    change: Change,
    receipts: &mpsc::UnboundedSender<(Checkpoint, SendReceipt)>,
) -> Result<(), SinkError> {
    let key = if let Some(begin) = change.message.begin() {
        let key = format!("{:x}", begin.remote_xid);
        *xid = Some(key.clone());
        key
    } else if let Some(current) = xid.as_deref() {
        current.to_string()
    } else {
        return Err(SinkError::IncompleteTransaction);
    };

    let mut payload = Vec::with_capacity(change.message.encoded_len());
    change
        .message
        .encode(&mut payload)
        .map_err(|err| SinkError::Serialisation(err.to_string()))?;

    let lsn = change.checkpoint.lsn;
    let receipt = producer
        .send(ProducerMessage {
            key,
            payload,
            properties: HashMap::from([(LSN_PROPERTY.to_string(), lsn.to_string())]),
            sequence_id: lsn.as_u64() as i64,
        })
        .await?;

    receipts
        .send((change.checkpoint, receipt))
        .map_err(|_| SinkError::Stopped)?;
    Ok(())
}

/// Awaits send receipts in submission order. A durable ack releases the
/// checkpoint to the committed channel; a failed send latches the error
/// and stops the sink without signalling.
async fn complete_receipts(
    mut receipts: mpsc::UnboundedReceiver<(Checkpoint, SendReceipt)>,
    committed: mpsc::Sender<Checkpoint>,
    shared: Arc<Shared>,
) {
    while let Some((checkpoint, receipt)) = receipts.recv().await {
        match receipt.await {
            Ok(Ok(_id)) => {
                if committed.send(checkpoint).await.is_err() {
                    // Nobody is consuming committed positions any more.
                    shared.stop();
                    return;
                }
            }
            Ok(Err(error)) => {
                shared.fail(SinkError::Broker(error));
                return;
            }
            Err(_) => {
                shared.fail(SinkError::Broker(BrokerError::Closed));
                return;
            }
        }
    }
}
