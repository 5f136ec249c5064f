//! Broker sink tests over the in-process broker.

use std::collections::HashMap;
use std::time::Duration;

use prost::Message as _;
use tokio::sync::mpsc;

use rill_core::{proto, Change, Checkpoint, Lsn};
use rill_sink::broker::memory::{MemoryBroker, StoredMessage};
use rill_sink::broker::BrokerError;
use rill_sink::{BrokerSink, BrokerSinkConfig, SinkError, SinkState, LSN_PROPERTY};

fn sink_on(broker: &MemoryBroker, topic: &str) -> BrokerSink {
    BrokerSink::new(Box::new(broker.client()), BrokerSinkConfig::new(topic))
}

fn seed(broker: &MemoryBroker, topic: &str, lsn: u64) {
    broker.publish(
        topic,
        StoredMessage {
            key: "seed".into(),
            payload: Vec::new(),
            properties: HashMap::from([(LSN_PROPERTY.to_string(), Lsn(lsn).to_string())]),
            sequence_id: lsn as i64,
        },
    );
}

fn begin(lsn: u64, xid: u32) -> Change {
    Change::new(
        Checkpoint::from(lsn),
        proto::Message::from_begin(proto::Begin {
            final_lsn: lsn + 3,
            commit_time: 0,
            remote_xid: xid,
        }),
    )
}

fn commit_marker(lsn: u64) -> Change {
    Change::new(
        Checkpoint::from(lsn),
        proto::Message::from_commit(proto::Commit {
            commit_lsn: lsn,
            end_lsn: lsn,
            commit_time: 0,
        }),
    )
}

fn row(lsn: u64, table: &str) -> Change {
    Change::new(
        Checkpoint::from(lsn),
        proto::Message::from_row(proto::RowChange {
            schema: "public".into(),
            table: table.into(),
            ..Default::default()
        }),
    )
}

/// A pre-filled change feed that drains once consumed.
async fn feed(changes: Vec<Change>) -> mpsc::Receiver<Change> {
    let (tx, rx) = mpsc::channel(64);
    for change in changes {
        tx.send(change).await.unwrap();
    }
    rx
}

async fn collect(mut committed: mpsc::Receiver<Checkpoint>) -> Vec<u64> {
    let mut out = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), committed.recv()).await {
            Ok(Some(checkpoint)) => out.push(checkpoint.lsn.as_u64()),
            Ok(None) => return out,
            Err(_) => panic!("timed out waiting for the committed sequence to end"),
        }
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_setup_resumes_from_the_topic_tail() {
    let broker = MemoryBroker::new();
    for lsn in [0x10, 0x20, 0x30] {
        seed(&broker, "changes", lsn);
    }

    let mut sink = sink_on(&broker, "changes");
    let checkpoint = sink.setup().await.unwrap();
    assert_eq!(checkpoint, Checkpoint::from(0x30));
    assert_eq!(sink.state(), SinkState::Ready);
}

#[tokio::test]
async fn test_setup_on_an_empty_topic_returns_zero() {
    let broker = MemoryBroker::new();
    let mut sink = sink_on(&broker, "changes");
    let checkpoint = sink.setup().await.unwrap();
    assert!(checkpoint.is_zero());
}

#[tokio::test]
async fn test_setup_rejects_a_malformed_lsn_property() {
    let broker = MemoryBroker::new();
    broker.publish(
        "changes",
        StoredMessage {
            key: "seed".into(),
            payload: Vec::new(),
            properties: HashMap::from([(LSN_PROPERTY.to_string(), "garbage".to_string())]),
            sequence_id: 1,
        },
    );

    let mut sink = sink_on(&broker, "changes");
    let err = sink.setup().await.unwrap_err();
    assert!(matches!(err, SinkError::Lsn(_)));
}

#[tokio::test]
async fn test_second_sink_on_the_same_topic_is_rejected() {
    let broker = MemoryBroker::new();
    let mut first = sink_on(&broker, "changes");
    first.setup().await.unwrap();

    let mut second = sink_on(&broker, "changes");
    let err = second.setup().await.unwrap_err();
    assert!(matches!(
        err,
        SinkError::Broker(BrokerError::ProducerInUse(_))
    ));
}

#[tokio::test]
async fn test_transaction_records_share_a_key_with_increasing_sequences() {
    let broker = MemoryBroker::new();
    let mut sink = sink_on(&broker, "changes");
    sink.setup().await.unwrap();

    let changes = feed(vec![
        begin(0x40, 0xABC),
        row(0x41, "orders"),
        row(0x42, "orders"),
        commit_marker(0x43),
    ])
    .await;
    let committed = sink.apply(changes).unwrap();
    assert_eq!(collect(committed).await, vec![0x40, 0x41, 0x42, 0x43]);

    let handle = sink.handle();
    wait_for("teardown", || handle.state() == SinkState::Closed).await;

    let records = broker.messages("changes");
    assert_eq!(records.len(), 4, "delimiters are emitted too");
    for record in &records {
        assert_eq!(record.key, "abc", "all records of one xact share a key");
    }
    let sequences: Vec<i64> = records.iter().map(|r| r.sequence_id).collect();
    assert_eq!(sequences, vec![0x40, 0x41, 0x42, 0x43]);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(
        records[1].properties.get(LSN_PROPERTY),
        Some(&Lsn(0x41).to_string())
    );

    // Payloads are the wire-encoded messages.
    let decoded = proto::Message::decode(records[0].payload.as_slice()).unwrap();
    assert_eq!(decoded.begin().map(|b| b.remote_xid), Some(0xABC));
}

#[tokio::test]
async fn test_a_new_begin_switches_the_record_key() {
    let broker = MemoryBroker::new();
    let mut sink = sink_on(&broker, "changes");
    sink.setup().await.unwrap();

    let changes = feed(vec![
        begin(0x50, 0xA),
        row(0x51, "orders"),
        begin(0x60, 0xB),
        row(0x61, "orders"),
    ])
    .await;
    let committed = sink.apply(changes).unwrap();
    assert_eq!(collect(committed).await.len(), 4);

    let keys: Vec<String> = broker
        .messages("changes")
        .into_iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(keys, vec!["a", "a", "b", "b"]);
}

#[tokio::test]
async fn test_a_row_before_any_begin_is_an_incomplete_transaction() {
    let broker = MemoryBroker::new();
    let mut sink = sink_on(&broker, "changes");
    sink.setup().await.unwrap();

    let committed = sink.apply(feed(vec![row(0x10, "orders")]).await).unwrap();
    assert!(collect(committed).await.is_empty());

    let handle = sink.handle();
    wait_for("latched error", || handle.error().is_some()).await;
    assert_eq!(sink.error(), Some(SinkError::IncompleteTransaction));
    assert!(broker.messages("changes").is_empty());
}

#[tokio::test]
async fn test_committed_signals_only_after_the_durable_ack() {
    let broker = MemoryBroker::new();
    broker.hold_acks();

    let mut sink = sink_on(&broker, "changes");
    sink.setup().await.unwrap();
    let mut committed = sink.apply(feed(vec![begin(0x70, 0x1)]).await).unwrap();

    // The record is on the topic but unacknowledged: no committed signal.
    let early = tokio::time::timeout(Duration::from_millis(100), committed.recv()).await;
    assert!(early.is_err(), "committed must wait for the broker ack");

    broker.release_acks();
    let checkpoint = tokio::time::timeout(Duration::from_secs(2), committed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint, Checkpoint::from(0x70));
}

#[tokio::test]
async fn test_send_failure_latches_the_error_and_stops() {
    let broker = MemoryBroker::new();
    broker.inject_send_error(BrokerError::SendFailed("broker rejected the batch".into()));

    let mut sink = sink_on(&broker, "changes");
    sink.setup().await.unwrap();
    let handle = sink.handle();

    let (tx, rx) = mpsc::channel(8);
    tx.send(begin(0x80, 0x2)).await.unwrap();
    let committed = sink.apply(rx).unwrap();

    assert!(collect(committed).await.is_empty());
    wait_for("latched error", || handle.error().is_some()).await;
    assert!(matches!(
        handle.error(),
        Some(SinkError::Broker(BrokerError::SendFailed(_)))
    ));
    wait_for("teardown", || handle.state() == SinkState::Closed).await;
    assert!(
        !broker.has_exclusive_producer("changes"),
        "teardown must release the exclusive claim"
    );
    drop(tx);
}

#[tokio::test]
async fn test_apply_after_stop_yields_the_latched_state() {
    let broker = MemoryBroker::new();
    let mut sink = sink_on(&broker, "changes");
    sink.setup().await.unwrap();
    sink.stop();

    let (_tx, rx) = mpsc::channel(1);
    let err = sink.apply(rx).unwrap_err();
    assert_eq!(err, SinkError::Stopped);
}

#[tokio::test]
async fn test_stop_mid_stream_ends_the_committed_sequence() {
    let broker = MemoryBroker::new();
    let mut sink = sink_on(&broker, "changes");
    sink.setup().await.unwrap();
    let handle = sink.handle();

    let (tx, rx) = mpsc::channel(8);
    tx.send(begin(0x90, 0x3)).await.unwrap();
    let mut committed = sink.apply(rx).unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), committed.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(Checkpoint::from(0x90)));

    sink.stop();
    let end = tokio::time::timeout(Duration::from_secs(2), committed.recv())
        .await
        .unwrap();
    assert_eq!(end, None, "committed ends once the sink stops");
    wait_for("teardown", || handle.state() == SinkState::Closed).await;
    drop(tx);
}

#[tokio::test]
async fn test_a_restarted_sink_resumes_where_the_last_one_stopped() {
    let broker = MemoryBroker::new();

    let mut first = sink_on(&broker, "changes");
    assert!(first.setup().await.unwrap().is_zero());
    let committed = first
        .apply(feed(vec![begin(0xA0, 0x4), row(0xA1, "orders")]).await)
        .unwrap();
    assert_eq!(collect(committed).await, vec![0xA0, 0xA1]);
    let handle = first.handle();
    wait_for("first teardown", || handle.state() == SinkState::Closed).await;

    // The fixed producer name is free again; the next sink picks up at
    // the tail the first one wrote.
    let mut second = sink_on(&broker, "changes");
    let resumed = second.setup().await.unwrap();
    assert_eq!(resumed, Checkpoint::from(0xA1));
}
