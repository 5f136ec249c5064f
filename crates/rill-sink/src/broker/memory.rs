//! In-process broker used by tests.
//!
//! Implements the whole broker seam over per-topic message logs: named
//! exclusive producers, latest-inclusive tail readers with read deadlines,
//! a semaphore-bounded pending queue, and knobs for holding acks and
//! injecting send failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};

use super::{
    AccessMode, BrokerClient, BrokerError, MessageId, ProducerMessage, ProducerOptions,
    ReaderMessage, ReaderOptions, SendReceipt, StartPosition, TopicProducer, TopicReader,
};

/// A message stored on an in-memory topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Partitioning and batching key.
    pub key: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Per-message properties.
    pub properties: HashMap<String, String>,
    /// Producer-assigned sequence id.
    pub sequence_id: i64,
}

struct TopicState {
    messages: Mutex<Vec<StoredMessage>>,
    exclusive: Mutex<Option<String>>,
}

struct Parked {
    tx: oneshot::Sender<Result<MessageId, BrokerError>>,
    id: MessageId,
    _permit: OwnedSemaphorePermit,
}

struct Inner {
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    send_errors: Mutex<VecDeque<BrokerError>>,
    hold_acks: AtomicBool,
    parked: Mutex<Vec<Parked>>,
    parked_changed: Notify,
}

impl Inner {
    fn topic(&self, name: &str) -> Arc<TopicState> {
        Arc::clone(
            self.topics
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(TopicState {
                        messages: Mutex::new(Vec::new()),
                        exclusive: Mutex::new(None),
                    })
                }),
        )
    }
}

/// The in-process broker. Cheap to clone; clones share the topic space.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        MemoryBroker {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                send_errors: Mutex::new(VecDeque::new()),
                hold_acks: AtomicBool::new(false),
                parked: Mutex::new(Vec::new()),
                parked_changed: Notify::new(),
            }),
        }
    }

    /// Opens a client connection.
    #[must_use]
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }
    }

    /// Appends a message directly to a topic, bypassing any producer.
    pub fn publish(&self, topic: &str, message: StoredMessage) {
        self.inner.topic(topic).messages.lock().push(message);
    }

    /// The messages stored on a topic, in publish order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<StoredMessage> {
        self.inner.topic(topic).messages.lock().clone()
    }

    /// Whether a topic currently has an exclusive producer attached.
    #[must_use]
    pub fn has_exclusive_producer(&self, topic: &str) -> bool {
        self.inner.topic(topic).exclusive.lock().is_some()
    }

    /// Queues a failure for the next producer send.
    pub fn inject_send_error(&self, error: BrokerError) {
        self.inner.send_errors.lock().push_back(error);
    }

    /// Parks subsequent send acks until [`release_acks`](Self::release_acks).
    pub fn hold_acks(&self) {
        self.inner.hold_acks.store(true, Ordering::SeqCst);
    }

    /// Resolves every parked ack and resumes immediate acking.
    pub fn release_acks(&self) {
        self.inner.hold_acks.store(false, Ordering::SeqCst);
        let parked: Vec<Parked> = std::mem::take(&mut *self.inner.parked.lock());
        for entry in parked {
            let _ = entry.tx.send(Ok(entry.id));
        }
        self.inner.parked_changed.notify_waiters();
    }
}

/// A client connection to a [`MemoryBroker`].
pub struct MemoryClient {
    inner: Arc<Inner>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn create_reader(
        &self,
        options: ReaderOptions,
    ) -> Result<Box<dyn TopicReader>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let topic = self.inner.topic(&options.topic);
        let len = topic.messages.lock().len();
        let pos = match options.start {
            StartPosition::Earliest => 0,
            StartPosition::Latest if options.start_inclusive => len.saturating_sub(1),
            StartPosition::Latest => len,
        };
        Ok(Box::new(MemoryReader {
            topic,
            pos,
            closed: false,
        }))
    }

    async fn create_producer(
        &self,
        options: ProducerOptions,
    ) -> Result<Box<dyn TopicProducer>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let topic = self.inner.topic(&options.topic);
        let exclusive = options.access_mode == AccessMode::Exclusive;
        if exclusive {
            let mut owner = topic.exclusive.lock();
            if owner.is_some() {
                return Err(BrokerError::ProducerInUse(options.name));
            }
            *owner = Some(options.name.clone());
        }
        Ok(Box::new(MemoryProducer {
            inner: Arc::clone(&self.inner),
            topic,
            name: options.name,
            exclusive,
            permits: Arc::new(Semaphore::new(options.max_pending_messages.max(1))),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryReader {
    topic: Arc<TopicState>,
    pos: usize,
    closed: bool,
}

impl MemoryReader {
    fn take_next(&mut self) -> Option<ReaderMessage> {
        let stored = self.topic.messages.lock().get(self.pos).cloned()?;
        self.pos += 1;
        Some(ReaderMessage {
            key: Some(stored.key),
            payload: stored.payload,
            properties: stored.properties,
            sequence_id: stored.sequence_id,
        })
    }
}

#[async_trait]
impl TopicReader for MemoryReader {
    async fn has_next(&mut self) -> Result<bool, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        Ok(self.pos < self.topic.messages.lock().len())
    }

    async fn next(&mut self, read_timeout: Duration) -> Result<ReaderMessage, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if let Some(message) = self.take_next() {
            return Ok(message);
        }
        // Coarse deadline: one re-check after the full wait.
        tokio::time::sleep(read_timeout).await;
        self.take_next().ok_or(BrokerError::DeadlineExceeded)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

struct MemoryProducer {
    inner: Arc<Inner>,
    topic: Arc<TopicState>,
    name: String,
    exclusive: bool,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

#[async_trait]
impl TopicProducer for MemoryProducer {
    async fn send(&self, message: ProducerMessage) -> Result<SendReceipt, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::Closed)?;
        let (tx, rx) = oneshot::channel();

        if let Some(error) = self.inner.send_errors.lock().pop_front() {
            let _ = tx.send(Err(error));
            return Ok(rx);
        }

        let id = {
            let mut log = self.topic.messages.lock();
            log.push(StoredMessage {
                key: message.key,
                payload: message.payload,
                properties: message.properties,
                sequence_id: message.sequence_id,
            });
            MessageId(log.len() as u64)
        };

        if self.inner.hold_acks.load(Ordering::SeqCst) {
            self.inner.parked.lock().push(Parked {
                tx,
                id,
                _permit: permit,
            });
        } else {
            let _ = tx.send(Ok(id));
        }
        Ok(rx)
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        loop {
            let drained = self.inner.parked_changed.notified();
            tokio::pin!(drained);
            // Register before the emptiness check so a release racing in
            // between still wakes us.
            drained.as_mut().enable();
            if self.inner.parked.lock().is_empty() {
                return Ok(());
            }
            drained.await;
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.exclusive {
            let mut owner = self.topic.exclusive.lock();
            if owner.as_deref() == Some(self.name.as_str()) {
                *owner = None;
            }
        }
    }
}
