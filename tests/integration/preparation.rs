//! Integration tests for channel preparation through the observer.
//!
//! Covers the supported target kinds, the unsupported ones, transport
//! failures at each stage and the step watchdog. A session whose
//! preparation aborts must leave no entries and no registration behind.

use std::sync::Arc;
use std::time::Duration;

use textlog::channel::{SessionConfig, SessionError, SessionState};
use textlog::observer::Observer;
use textlog::transport::loopback::LoopbackChannel;
use textlog::transport::{SignalKind, TransportError};
use textlog_proto::channel::{ChannelPath, ContactRef, Handle, HandleKind};
use textlog_proto::pending::{LegacyPendingMessage, PendingSnapshot};
use textlog_store::InMemoryAckStore;

fn me() -> ContactRef {
    ContactRef::new(Handle::new(1), "me@example.com", "Me")
}

fn pending_one() -> PendingSnapshot {
    PendingSnapshot::Legacy(vec![LegacyPendingMessage {
        id: 1,
        timestamp: 1_704_067_200,
        sender: 2,
        message_type: 0,
        flags: 0,
        text: "waiting".into(),
    }])
}

fn observer() -> (Observer<InMemoryAckStore>, Arc<InMemoryAckStore>) {
    let store = Arc::new(InMemoryAckStore::new());
    (Observer::new(Arc::clone(&store), SessionConfig::default()), store)
}

#[tokio::test]
async fn unsupported_target_kinds_log_nothing() {
    for kind in [HandleKind::Group, HandleKind::List, HandleKind::None] {
        let (mut observer, store) = observer();
        let (channel, _remote) = LoopbackChannel::builder("/ch/g", "/acc/1")
            .with_self(me())
            .with_target(kind, Handle::new(9))
            .with_pending(pending_one())
            .build();

        let id = observer.observe(channel).unwrap();
        observer.settle().await;
        assert_eq!(observer.state(id), Some(SessionState::Failed));

        let reports = observer.join_all().await;
        assert!(matches!(
            reports[0].error,
            Some(SessionError::UnsupportedHandleKind(k)) if k == kind
        ));
        assert!(reports[0].reconciled.is_none());
        assert!(store.is_empty().await, "{kind} channel must not be logged");
        assert!(!observer.registry().is_observed(&ChannelPath::new("/ch/g")));
    }
}

#[tokio::test]
async fn room_channel_logs_pending_messages_with_resolved_participants() {
    let (mut observer, store) = observer();
    let (channel, remote) = LoopbackChannel::builder("/ch/room", "/acc/1")
        .with_self(me())
        .with_room(Handle::new(50), "lobby@conference.example.com")
        .with_contact(ContactRef::new(Handle::new(2), "bob@example.com", "Bob"))
        .with_pending(pending_one())
        .build();

    observer.observe(channel).unwrap();
    observer.settle().await;
    remote.close().await;
    let reports = observer.join_all().await;

    assert_eq!(reports[0].state, SessionState::Closed);
    let entries = store.entries(&ChannelPath::new("/ch/room")).await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].chatroom);
    assert_eq!(entries[0].chat_id, "lobby@conference.example.com");
    assert_eq!(entries[0].sender.identifier, "bob@example.com");
    assert_eq!(entries[0].receiver, None);
}

#[tokio::test]
async fn transport_failures_abort_before_logging() {
    let cases: Vec<(&str, LoopbackChannel)> = vec![
        (
            "subscribe",
            LoopbackChannel::builder("/ch/1", "/acc/1")
                .with_self(me())
                .with_peer(ContactRef::new(Handle::new(2), "bob@example.com", "Bob"))
                .with_pending(pending_one())
                .failing_subscribe(SignalKind::PendingMessagesRemoved)
                .build()
                .0,
        ),
        (
            "prepare",
            LoopbackChannel::builder("/ch/1", "/acc/1")
                .with_self(me())
                .with_peer(ContactRef::new(Handle::new(2), "bob@example.com", "Bob"))
                .with_pending(pending_one())
                .failing_prepare()
                .build()
                .0,
        ),
        (
            "peer lookup",
            LoopbackChannel::builder("/ch/1", "/acc/1")
                .with_self(me())
                .with_peer(ContactRef::new(Handle::new(2), "bob@example.com", "Bob"))
                .with_pending(pending_one())
                .failing_contact(Handle::new(2))
                .build()
                .0,
        ),
        (
            "pending fetch",
            LoopbackChannel::builder("/ch/1", "/acc/1")
                .with_self(me())
                .with_peer(ContactRef::new(Handle::new(2), "bob@example.com", "Bob"))
                .with_pending(pending_one())
                .failing_pending_fetch()
                .build()
                .0,
        ),
    ];

    for (stage, channel) in cases {
        let (mut observer, store) = observer();
        observer.observe(channel).unwrap();
        let reports = observer.join_all().await;

        assert_eq!(reports[0].state, SessionState::Failed, "{stage}");
        assert!(
            matches!(reports[0].error, Some(SessionError::Transport(_))),
            "{stage}: {:?}",
            reports[0].error
        );
        assert!(store.is_empty().await, "{stage}");
        assert!(observer.registry().observed().is_empty(), "{stage}");
    }
}

#[tokio::test]
async fn failed_channel_can_be_attached_again() {
    let (mut observer, store) = observer();
    let (broken, _) = LoopbackChannel::builder("/ch/1", "/acc/1")
        .with_self(me())
        .failing_contact(Handle::new(1))
        .build();
    observer.observe(broken).unwrap();
    let reports = observer.join_all().await;
    assert!(matches!(
        reports[0].error,
        Some(SessionError::Transport(TransportError::UnknownHandle(h))) if h == Handle::new(1)
    ));

    let (fixed, remote) = LoopbackChannel::builder("/ch/1", "/acc/1")
        .with_self(me())
        .with_peer(ContactRef::new(Handle::new(2), "bob@example.com", "Bob"))
        .with_pending(pending_one())
        .build();
    observer.observe(fixed).unwrap();
    observer.settle().await;
    remote.close().await;
    let reports = observer.join_all().await;

    assert_eq!(reports[0].state, SessionState::Closed);
    assert_eq!(store.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_channel_trips_the_watchdog() {
    let store = Arc::new(InMemoryAckStore::new());
    let config = SessionConfig {
        step_timeout: Some(Duration::from_secs(5)),
        ..SessionConfig::default()
    };
    let mut observer = Observer::new(Arc::clone(&store), config);
    let (channel, _remote) = LoopbackChannel::builder("/ch/1", "/acc/1")
        .with_self(me())
        .stalling_prepare()
        .build();

    observer.observe(channel).unwrap();
    let reports = observer.join_all().await;

    assert!(matches!(
        reports[0].error,
        Some(SessionError::StepStalled { step: "prepare_channel", after }) if after == Duration::from_secs(5)
    ));
    assert!(observer.registry().observed().is_empty());
}
