//! In-memory collaborators for tests.
//!
//! These mocks are library code rather than test-only fixtures so that
//! downstream crates can drive the gateway and sink against scripted
//! sources without their own scaffolding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::change::Change;
use crate::checkpoint::{Checkpoint, Lsn};
use crate::proto;
use crate::source::{
    ChangeSource, DumpAck, DumpInfoPuller, SourceDumper, SourceError, SourceResolver,
};

/// A scripted [`ChangeSource`] that records cursor movements.
///
/// [`MockSource::new`] hands back the feed sender; tests push [`Change`]s
/// through it at will and close it to end the live stream.
pub struct MockSource {
    feed: Mutex<Option<mpsc::Receiver<Change>>>,
    commits: Mutex<Vec<Checkpoint>>,
    requeues: Mutex<Vec<Checkpoint>>,
    stopped: AtomicBool,
    fail_capture: bool,
}

impl MockSource {
    /// Creates a source and the sender feeding its live stream.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::Sender<Change>) {
        let (tx, rx) = mpsc::channel(64);
        let source = Arc::new(MockSource {
            feed: Mutex::new(Some(rx)),
            commits: Mutex::new(Vec::new()),
            requeues: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            fail_capture: false,
        });
        (source, tx)
    }

    /// Creates a source whose `capture` call always fails.
    #[must_use]
    pub fn failing() -> Arc<Self> {
        Arc::new(MockSource {
            feed: Mutex::new(None),
            commits: Mutex::new(Vec::new()),
            requeues: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            fail_capture: true,
        })
    }

    /// Checkpoints committed so far, in arrival order.
    #[must_use]
    pub fn commits(&self) -> Vec<Checkpoint> {
        self.commits.lock().clone()
    }

    /// Checkpoints requeued so far, in arrival order.
    #[must_use]
    pub fn requeues(&self) -> Vec<Checkpoint> {
        self.requeues.lock().clone()
    }

    /// Whether `stop` has been called.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeSource for MockSource {
    async fn capture(&self, _from: Checkpoint) -> Result<mpsc::Receiver<Change>, SourceError> {
        if self.fail_capture {
            return Err(SourceError::Capture {
                reason: "scripted capture failure".into(),
            });
        }
        self.feed.lock().take().ok_or(SourceError::Capture {
            reason: "feed already captured".into(),
        })
    }

    async fn commit(&self, checkpoint: Checkpoint) {
        self.commits.lock().push(checkpoint);
    }

    async fn requeue(&self, checkpoint: Checkpoint) {
        self.requeues.lock().push(checkpoint);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// A [`SourceResolver`] returning one scripted source, recording the URIs
/// it was asked to resolve.
pub struct MockResolver {
    source: Option<Arc<MockSource>>,
    resolved: Mutex<Vec<String>>,
}

impl MockResolver {
    /// Resolves every URI to `source`.
    #[must_use]
    pub fn new(source: Arc<MockSource>) -> Self {
        MockResolver {
            source: Some(source),
            resolved: Mutex::new(Vec::new()),
        }
    }

    /// Fails every resolve call.
    #[must_use]
    pub fn failing() -> Self {
        MockResolver {
            source: None,
            resolved: Mutex::new(Vec::new()),
        }
    }

    /// URIs passed to `resolve`, in call order.
    #[must_use]
    pub fn resolved(&self) -> Vec<String> {
        self.resolved.lock().clone()
    }
}

#[async_trait]
impl SourceResolver for MockResolver {
    async fn resolve(&self, uri: &str) -> Result<Arc<dyn ChangeSource>, SourceError> {
        self.resolved.lock().push(uri.to_string());
        match &self.source {
            Some(source) => Ok(Arc::clone(source) as Arc<dyn ChangeSource>),
            None => Err(SourceError::Resolve {
                uri: uri.to_string(),
                reason: "scripted resolve failure".into(),
            }),
        }
    }
}

/// A [`DumpInfoPuller`] fed by the test, recording every ack it observes.
pub struct MockDumpPuller {
    dumps: Mutex<Option<mpsc::Receiver<proto::DumpInfo>>>,
    acks: Arc<Mutex<Vec<DumpAck>>>,
}

impl MockDumpPuller {
    /// Creates a puller and the sender feeding its dump descriptors.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::Sender<proto::DumpInfo>) {
        let (tx, rx) = mpsc::channel(16);
        let puller = Arc::new(MockDumpPuller {
            dumps: Mutex::new(Some(rx)),
            acks: Arc::new(Mutex::new(Vec::new())),
        });
        (puller, tx)
    }

    /// Acks observed so far, in arrival order.
    #[must_use]
    pub fn acks(&self) -> Vec<DumpAck> {
        self.acks.lock().clone()
    }
}

#[async_trait]
impl DumpInfoPuller for MockDumpPuller {
    async fn pull(
        &self,
        _uri: &str,
        mut acks: mpsc::Receiver<DumpAck>,
    ) -> mpsc::Receiver<proto::DumpInfo> {
        let observed = Arc::clone(&self.acks);
        tokio::spawn(async move {
            while let Some(ack) = acks.recv().await {
                observed.lock().push(ack);
            }
        });
        self.dumps.lock().take().unwrap_or_else(|| {
            // A second pull gets a feed that never yields; ending it would
            // terminate the forwarder under test.
            let (tx, rx) = mpsc::channel(1);
            std::mem::forget(tx);
            rx
        })
    }
}

/// A [`SourceDumper`] serving scripted batches and recording each call's
/// floor LSN and descriptor.
pub struct MockDumper {
    batches: Mutex<VecDeque<Result<Vec<proto::RowChange>, SourceError>>>,
    calls: Mutex<Vec<(Lsn, proto::DumpInfo)>>,
}

impl MockDumper {
    /// Creates a dumper with no scripted batches; unscripted calls return
    /// an empty batch.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(MockDumper {
            batches: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queues the outcome of the next `load_dump` call.
    pub fn script(&self, batch: Result<Vec<proto::RowChange>, SourceError>) {
        self.batches.lock().push_back(batch);
    }

    /// Recorded `(floor, descriptor)` pairs, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<(Lsn, proto::DumpInfo)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SourceDumper for MockDumper {
    async fn load_dump(
        &self,
        min_lsn: Lsn,
        info: &proto::DumpInfo,
    ) -> Result<Vec<proto::RowChange>, SourceError> {
        self.calls.lock().push((min_lsn, info.clone()));
        self.batches
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_source_records_cursor_movements() {
        let (source, feed) = MockSource::new();
        let mut changes = source.capture(Checkpoint::ZERO).await.unwrap();

        let change = Change::new(
            Checkpoint::from(7),
            proto::Message::from_row(proto::RowChange::default()),
        );
        feed.send(change.clone()).await.unwrap();
        assert_eq!(changes.recv().await, Some(change));

        source.commit(Checkpoint::from(7)).await;
        source.requeue(Checkpoint::from(3)).await;
        source.stop().await;
        assert_eq!(source.commits(), vec![Checkpoint::from(7)]);
        assert_eq!(source.requeues(), vec![Checkpoint::from(3)]);
        assert!(source.stopped());
    }

    #[tokio::test]
    async fn test_mock_dumper_serves_scripts_in_order() {
        let dumper = MockDumper::new();
        dumper.script(Err(SourceError::Dump {
            reason: "gone".into(),
        }));
        let info = proto::DumpInfo::default();

        assert!(dumper.load_dump(Lsn(5), &info).await.is_err());
        // Unscripted calls fall back to an empty batch.
        assert_eq!(dumper.load_dump(Lsn(6), &info).await.unwrap(), Vec::new());
        let floors: Vec<Lsn> = dumper.calls().into_iter().map(|(lsn, _)| lsn).collect();
        assert_eq!(floors, vec![Lsn(5), Lsn(6)]);
    }
}
