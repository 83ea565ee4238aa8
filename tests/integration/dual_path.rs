//! Integration tests for the two ingestion paths sharing one index.
//!
//! A message can reach the logger through the attach-time reconciliation of
//! the pending queue and through a live `received` signal. Whichever path
//! sees it first logs it; the other finds its token and skips it.
//!
//! Scenarios:
//! 1. A message already logged is seen again by reconciliation, then live,
//!    then removed: one entry, acknowledged at the end.
//! 2. A message raised live while preparation is still running and also
//!    present in the pending queue is logged once.
//! 3. A pending entry the channel no longer holds is acknowledged on attach.
//! 4. A restart against the same SQLite index does not log anything twice.
//! 5. Attaching one channel acknowledges old pending entries of another,
//!    unattached channel.

use std::sync::Arc;
use std::time::Duration;

use textlog::channel::{SessionConfig, SessionState};
use textlog::observer::Observer;
use textlog::transport::ChannelSignal;
use textlog::transport::loopback::{LoopbackChannel, LoopbackRemote};
use textlog_proto::channel::{AccountPath, ChannelPath, ContactRef, Handle};
use textlog_proto::entry::{Direction, LogEntryText, MessageFlags, MessageType, PendingAck};
use textlog_proto::pending::{LegacyPendingMessage, PendingMessage, PendingSnapshot};
use textlog_proto::token::{PendingMessageId, tokenize};
use textlog_store::{AckStore, InMemoryAckStore, SqliteAckStore};

/// 2024-01-01T00:00:00Z.
const T1_TIME: i64 = 1_704_067_200;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn me() -> ContactRef {
    ContactRef::new(Handle::new(1), "me@example.com", "Me")
}

fn bob() -> ContactRef {
    ContactRef::new(Handle::new(2), "bob@example.com", "Bob")
}

/// Keeps the attach-time sweep away from the fixed 2024 timestamps.
fn config() -> SessionConfig {
    SessionConfig {
        retention: Duration::from_secs(100 * 365 * 24 * 60 * 60),
        ..SessionConfig::default()
    }
}

fn message(id: u32, body: &str) -> PendingMessage {
    PendingMessage {
        id: PendingMessageId::new(id),
        timestamp: T1_TIME,
        sender: Handle::new(2),
        message_type: MessageType::Normal,
        flags: MessageFlags::empty(),
        body: body.to_string(),
    }
}

fn legacy(id: u32, body: &str) -> LegacyPendingMessage {
    LegacyPendingMessage {
        id,
        timestamp: u32::try_from(T1_TIME).unwrap(),
        sender: 2,
        message_type: 0,
        flags: 0,
        text: body.to_string(),
    }
}

fn channel(pending: PendingSnapshot) -> (LoopbackChannel, LoopbackRemote) {
    LoopbackChannel::builder("/ch/1", "/acc/1")
        .with_self(me())
        .with_peer(bob())
        .with_pending(pending)
        .build()
}

fn logged_entry(id: u32, body: &str) -> LogEntryText {
    let channel = ChannelPath::new("/ch/1");
    LogEntryText {
        token: tokenize(&channel, T1_TIME, PendingMessageId::new(id)),
        account: AccountPath::new("/acc/1"),
        channel,
        direction: Direction::In,
        chat_id: "bob@example.com".into(),
        chatroom: false,
        timestamp: T1_TIME,
        sender: bob(),
        receiver: Some(me()),
        body: body.to_string(),
        message_type: MessageType::Normal,
        pending: PendingAck::Pending(PendingMessageId::new(id)),
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn known_message_seen_by_both_paths_is_logged_once_then_acknowledged() {
    let store = Arc::new(InMemoryAckStore::new());
    let t1 = logged_entry(42, "hello");
    store.insert(&t1).await.unwrap();

    let mut observer = Observer::new(Arc::clone(&store), config());
    let (channel, remote) = channel(PendingSnapshot::Legacy(vec![legacy(42, "hello")]));
    observer.observe(channel).unwrap();
    observer.settle().await;

    // Reconciliation found T1 live and already pending: nothing new.
    assert_eq!(store.len().await, 1);
    assert!(store.ack_state(&t1.token).await.unwrap().is_pending());

    // The same message arrives live.
    remote.emit(ChannelSignal::Received(message(42, "hello"))).await;
    // And is then removed from the channel's queue.
    remote.acknowledge(vec![PendingMessageId::new(42)]).await;
    remote.close().await;

    let reports = observer.join_all().await;
    let report = &reports[0];
    let reconciled = report.reconciled.as_ref().unwrap();
    assert_eq!(reconciled.already_logged, 1);
    assert_eq!(reconciled.logged, 0);
    assert_eq!(reconciled.stale_acknowledged, 0);
    assert_eq!(report.live.duplicates, 1);
    assert_eq!(report.live.acknowledged, 1);

    assert_eq!(store.len().await, 1);
    assert_eq!(store.ack_state(&t1.token).await, Some(PendingAck::Acknowledged));
}

#[tokio::test]
async fn message_raised_during_preparation_is_logged_once() {
    let store = Arc::new(InMemoryAckStore::new());
    let mut observer = Observer::new(Arc::clone(&store), config());
    let (channel, remote) = channel(PendingSnapshot::Legacy(vec![legacy(7, "early")]));

    let id = observer.observe(channel).unwrap();
    observer.wait_subscribed(id).await.unwrap();
    remote.emit(ChannelSignal::Received(message(7, "early"))).await;
    observer.settle().await;
    assert_eq!(observer.state(id), Some(SessionState::Ready));

    remote.close().await;
    let reports = observer.join_all().await;

    let report = &reports[0];
    assert_eq!(report.reconciled.as_ref().unwrap().logged, 1);
    assert_eq!(report.live.duplicates, 1);
    assert_eq!(report.live.logged, 0);

    let entries = store.entries(&ChannelPath::new("/ch/1")).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].body, "early");
    assert_eq!(entries[0].sender, bob());
    assert_eq!(entries[0].receiver, Some(me()));
}

#[tokio::test]
async fn entry_acknowledged_while_unobserved_is_acknowledged_on_attach() {
    let store = Arc::new(InMemoryAckStore::new());
    let gone = logged_entry(5, "read elsewhere");
    let still_there = logged_entry(6, "unread");
    store.insert(&gone).await.unwrap();
    store.insert(&still_there).await.unwrap();

    let mut observer = Observer::new(Arc::clone(&store), config());
    let (channel, remote) = channel(PendingSnapshot::Legacy(vec![legacy(6, "unread")]));
    observer.observe(channel).unwrap();
    observer.settle().await;
    remote.close().await;
    let reports = observer.join_all().await;

    let reconciled = reports[0].reconciled.as_ref().unwrap();
    assert_eq!(reconciled.stale_acknowledged, 1);
    assert_eq!(reconciled.already_logged, 1);
    assert_eq!(store.ack_state(&gone.token).await, Some(PendingAck::Acknowledged));
    assert!(store.ack_state(&still_there.token).await.unwrap().is_pending());
}

#[tokio::test]
async fn restart_against_the_same_index_logs_nothing_twice() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.sqlite");

    // First run: one message arrives live and stays pending on the channel.
    {
        let store = Arc::new(SqliteAckStore::open(&db).unwrap());
        let mut observer = Observer::new(Arc::clone(&store), config());
        let (channel, remote) = channel(PendingSnapshot::Legacy(Vec::new()));
        observer.observe(channel).unwrap();
        observer.settle().await;
        remote.deliver(message(42, "hello")).await;
        remote.deliver(message(43, "again")).await;
        remote.close().await;
        let reports = observer.join_all().await;
        assert_eq!(reports[0].live.logged, 2);
    }

    // Second run: 42 is still pending on the channel, 43 was read elsewhere.
    let store = Arc::new(SqliteAckStore::open(&db).unwrap());
    let mut observer = Observer::new(Arc::clone(&store), config());
    let (channel, remote) = channel(PendingSnapshot::Legacy(vec![legacy(42, "hello")]));
    observer.observe(channel).unwrap();
    observer.settle().await;
    remote.close().await;
    let reports = observer.join_all().await;

    let reconciled = reports[0].reconciled.as_ref().unwrap();
    assert_eq!(reconciled.already_logged, 1);
    assert_eq!(reconciled.logged, 0);
    assert_eq!(reconciled.stale_acknowledged, 1);

    let path = ChannelPath::new("/ch/1");
    let t1 = tokenize(&path, T1_TIME, PendingMessageId::new(42));
    assert_eq!(store.pending_messages(&path).await.unwrap(), vec![t1.clone()]);
    assert_eq!(store.entry(&t1).unwrap().unwrap().body, "hello");
}

#[tokio::test]
async fn attach_sweeps_old_pending_entries_of_other_channels() {
    let store = Arc::new(InMemoryAckStore::new());
    let elsewhere = ChannelPath::new("/ch/9");
    let mut old = logged_entry(3, "long gone");
    old.token = tokenize(&elsewhere, 1_000, PendingMessageId::new(3));
    old.channel = elsewhere.clone();
    old.timestamp = 1_000;
    store.insert(&old).await.unwrap();

    // Default retention: the sweep is not held back.
    let mut observer = Observer::new(Arc::clone(&store), SessionConfig::default());
    let (channel, remote) = channel(PendingSnapshot::Legacy(Vec::new()));
    let id = observer.observe(channel).unwrap();
    observer.settle().await;

    assert_eq!(observer.state(id), Some(SessionState::Ready));
    assert_eq!(store.ack_state(&old.token).await, Some(PendingAck::Acknowledged));
    assert!(store.pending_messages(&elsewhere).await.unwrap().is_empty());

    remote.close().await;
    let reports = observer.join_all().await;
    assert_eq!(reports[0].reconciled.as_ref().unwrap().stale_acknowledged, 0);
}
