//! Integration tests for live signal handling on a ready session.
//!
//! Verifies which signals produce log entries, how they are attributed in
//! one-to-one and room channels, and that retransmissions collapse onto one
//! entry while distinct messages never do.

use std::sync::Arc;
use std::time::Duration;

use textlog::channel::{SessionConfig, SessionReport};
use textlog::observer::Observer;
use textlog::transport::loopback::{LoopbackChannel, LoopbackRemote};
use textlog::transport::{ChannelSignal, SendFailure, SentMessage};
use textlog_proto::channel::{ChannelPath, ContactRef, Handle};
use textlog_proto::entry::{Direction, MessageFlags, MessageType, PendingAck};
use textlog_proto::pending::PendingMessage;
use textlog_proto::token::PendingMessageId;
use textlog_store::InMemoryAckStore;

const TS: i64 = 1_704_067_200;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn me() -> ContactRef {
    ContactRef::new(Handle::new(1), "me@example.com", "Me")
}

fn bob() -> ContactRef {
    ContactRef::new(Handle::new(2), "bob@example.com", "Bob")
}

fn carol() -> ContactRef {
    ContactRef::new(Handle::new(3), "carol@example.com", "Carol")
}

fn received(id: u32, timestamp: i64, sender: u32, body: &str) -> PendingMessage {
    PendingMessage {
        id: PendingMessageId::new(id),
        timestamp,
        sender: Handle::new(sender),
        message_type: MessageType::Normal,
        flags: MessageFlags::empty(),
        body: body.to_string(),
    }
}

fn sent(timestamp: i64, body: &str) -> ChannelSignal {
    ChannelSignal::Sent(SentMessage {
        timestamp,
        message_type: MessageType::Normal,
        body: body.to_string(),
    })
}

/// Attaches `channel`, waits for it to be ready, runs `drive`, closes the
/// channel and returns the session report.
async fn run_session<F, Fut>(
    store: &Arc<InMemoryAckStore>,
    (channel, remote): (LoopbackChannel, LoopbackRemote),
    drive: F,
) -> SessionReport
where
    F: FnOnce(LoopbackRemote) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let config = SessionConfig {
        retention: Duration::from_secs(100 * 365 * 24 * 60 * 60),
        ..SessionConfig::default()
    };
    let mut observer = Observer::new(Arc::clone(store), config);
    observer.observe(channel).unwrap();
    observer.settle().await;

    drive(remote.clone()).await;
    remote.close().await;

    let mut reports = observer.join_all().await;
    assert_eq!(reports.len(), 1);
    reports.remove(0)
}

fn one_to_one() -> (LoopbackChannel, LoopbackRemote) {
    LoopbackChannel::builder("/ch/1", "/acc/1")
        .with_self(me())
        .with_peer(bob())
        .build()
}

// ---------------------------------------------------------------------------
// One-to-one
// ---------------------------------------------------------------------------

#[tokio::test]
async fn received_and_sent_messages_are_attributed() {
    let store = Arc::new(InMemoryAckStore::new());
    let report = run_session(&store, one_to_one(), |remote| async move {
        remote.deliver(received(42, TS, 2, "hi")).await;
        remote.emit(sent(TS + 1, "hello bob")).await;
    })
    .await;

    assert_eq!(report.live.logged, 2);
    let entries = store.entries(&ChannelPath::new("/ch/1")).await;
    assert_eq!(entries.len(), 2);

    let inbound = &entries[0];
    assert_eq!(inbound.direction, Direction::In);
    assert_eq!(inbound.sender, bob());
    assert_eq!(inbound.receiver, Some(me()));
    assert_eq!(inbound.chat_id, "bob@example.com");
    assert!(inbound.pending.is_pending());

    let outbound = &entries[1];
    assert_eq!(outbound.direction, Direction::Out);
    assert_eq!(outbound.sender, me());
    assert_eq!(outbound.receiver, Some(bob()));
    assert_eq!(outbound.pending, PendingAck::Acknowledged);
}

#[tokio::test]
async fn retransmission_collapses_but_distinct_ids_do_not() {
    let store = Arc::new(InMemoryAckStore::new());
    let report = run_session(&store, one_to_one(), |remote| async move {
        remote.emit(ChannelSignal::Received(received(1, TS, 2, "a"))).await;
        remote.emit(ChannelSignal::Received(received(1, TS, 2, "a"))).await;
        remote.emit(ChannelSignal::Received(received(2, TS, 2, "b"))).await;
    })
    .await;

    assert_eq!(report.live.logged, 2);
    assert_eq!(report.live.duplicates, 1);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn two_sends_in_the_same_second_share_a_token() {
    let store = Arc::new(InMemoryAckStore::new());
    let report = run_session(&store, one_to_one(), |remote| async move {
        remote.emit(sent(TS, "one")).await;
        remote.emit(sent(TS, "two")).await;
        remote.emit(sent(TS + 1, "three")).await;
    })
    .await;

    assert_eq!(report.live.logged, 2);
    assert_eq!(report.live.duplicates, 1);
    let bodies: Vec<_> = store
        .entries(&ChannelPath::new("/ch/1"))
        .await
        .into_iter()
        .map(|e| e.body)
        .collect();
    assert_eq!(bodies, vec!["one", "three"]);
}

#[tokio::test]
async fn failures_losses_and_notifications_are_not_logged() {
    let store = Arc::new(InMemoryAckStore::new());
    let report = run_session(&store, one_to_one(), |remote| async move {
        remote
            .emit(ChannelSignal::SendError(SendFailure {
                error: 3,
                timestamp: TS,
                message_type: MessageType::Normal,
                body: "lost".into(),
            }))
            .await;
        remote.emit(ChannelSignal::LostMessage).await;
        let mut notification = received(9, TS, 2, "");
        notification.message_type = MessageType::DeliveryReport;
        remote.emit(ChannelSignal::Received(notification)).await;
    })
    .await;

    assert_eq!(report.live.ignored, 3);
    assert_eq!(report.live.logged, 0);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn removal_acknowledges_only_matching_ids_in_this_channel() {
    let store = Arc::new(InMemoryAckStore::new());
    let other = run_session(
        &store,
        LoopbackChannel::builder("/ch/2", "/acc/1")
            .with_self(me())
            .with_peer(bob())
            .build(),
        |remote| async move {
            remote.deliver(received(42, TS, 2, "elsewhere")).await;
        },
    )
    .await;
    assert_eq!(other.live.logged, 1);

    let report = run_session(&store, one_to_one(), |remote| async move {
        remote.deliver(received(42, TS, 2, "here")).await;
        remote.deliver(received(43, TS, 2, "kept")).await;
        remote
            .acknowledge(vec![PendingMessageId::new(42), PendingMessageId::new(77)])
            .await;
    })
    .await;
    assert_eq!(report.live.acknowledged, 1);

    let here = store.entries(&ChannelPath::new("/ch/1")).await;
    assert_eq!(here[0].pending, PendingAck::Acknowledged);
    assert!(here[1].pending.is_pending());
    let elsewhere = store.entries(&ChannelPath::new("/ch/2")).await;
    assert!(elsewhere[0].pending.is_pending());
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

#[tokio::test]
async fn room_participants_are_resolved_once_each() {
    let store = Arc::new(InMemoryAckStore::new());
    let (channel, remote) = LoopbackChannel::builder("/ch/room", "/acc/1")
        .with_self(me())
        .with_room(Handle::new(50), "lobby@conference.example.com")
        .with_contact(bob())
        .with_contact(carol())
        .build();
    let lookups = remote.clone();

    let report = run_session(&store, (channel, remote), |remote| async move {
        remote.deliver(received(1, TS, 2, "from bob")).await;
        remote.deliver(received(2, TS, 3, "from carol")).await;
        remote.deliver(received(3, TS + 1, 2, "bob again")).await;
        // Unknown participant: dropped, session continues.
        remote.deliver(received(4, TS + 1, 99, "who?")).await;
        remote.deliver(received(5, TS + 2, 3, "carol again")).await;
    })
    .await;

    assert_eq!(report.live.logged, 4);
    assert_eq!(report.live.dropped, 1);
    // Self, bob, carol, and the failed lookup of 99.
    assert_eq!(lookups.contact_lookups(), 4);

    let entries = store.entries(&ChannelPath::new("/ch/room")).await;
    let senders: Vec<_> = entries.iter().map(|e| e.sender.alias.as_str()).collect();
    assert_eq!(senders, vec!["Bob", "Carol", "Bob", "Carol"]);
    assert!(entries.iter().all(|e| e.chatroom && e.receiver.is_none()));
    assert!(entries.iter().all(|e| e.chat_id == "lobby@conference.example.com"));
}
