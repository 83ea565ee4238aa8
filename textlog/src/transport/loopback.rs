//! Loopback text channel for testing and replay.
//!
//! A [`LoopbackChannel`] is an in-process [`TextChannel`] backed by a shared
//! table of contacts, rooms and pending messages. Built via
//! [`LoopbackChannel::builder`], which also returns a [`LoopbackRemote`]:
//! the far end of the channel, used to deliver messages, raise signals and
//! inject failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use textlog_proto::channel::{AccountPath, ChannelPath, ContactRef, Handle, HandleKind};
use textlog_proto::pending::{
    HEADER_PENDING_ID, HEADER_RECEIVED, HEADER_RESCUED, HEADER_SCROLLBACK, HEADER_SENDER,
    HEADER_TYPE, LegacyPendingMessage, MessagePart, PART_CONTENT, PartValue, PendingMessage,
    PendingSnapshot, RichPendingMessage,
};
use textlog_proto::entry::MessageFlags;
use textlog_proto::token::PendingMessageId;

use super::{ChannelSignal, SignalKind, TextChannel, TransportError};

#[derive(Debug, Default)]
struct Failures {
    subscribe: HashSet<SignalKind>,
    prepare: bool,
    stall_prepare: bool,
    contacts: HashSet<Handle>,
    pending_fetch: bool,
}

#[derive(Debug)]
struct State {
    contacts: HashMap<Handle, ContactRef>,
    pending: PendingSnapshot,
    subscribers: HashMap<SignalKind, Vec<mpsc::Sender<ChannelSignal>>>,
    failures: Failures,
    contact_lookups: usize,
}

#[derive(Debug)]
struct Shared {
    path: ChannelPath,
    account: AccountPath,
    target: (HandleKind, Handle),
    self_handle: Handle,
    rooms: HashMap<Handle, String>,
    state: Mutex<State>,
}

/// Builder for a [`LoopbackChannel`] and its [`LoopbackRemote`].
#[derive(Debug)]
pub struct LoopbackBuilder {
    path: ChannelPath,
    account: AccountPath,
    target: (HandleKind, Handle),
    self_handle: Handle,
    contacts: HashMap<Handle, ContactRef>,
    rooms: HashMap<Handle, String>,
    pending: PendingSnapshot,
    failures: Failures,
}

impl LoopbackBuilder {
    /// Targets a one-to-one conversation with `peer`.
    #[must_use]
    pub fn with_peer(mut self, peer: ContactRef) -> Self {
        self.target = (HandleKind::Contact, peer.handle);
        self.contacts.insert(peer.handle, peer);
        self
    }

    /// Targets the room `handle`, known as `room_id`.
    #[must_use]
    pub fn with_room(mut self, handle: Handle, room_id: impl Into<String>) -> Self {
        self.target = (HandleKind::Room, handle);
        self.rooms.insert(handle, room_id.into());
        self
    }

    /// Targets an arbitrary handle kind.
    #[must_use]
    pub const fn with_target(mut self, kind: HandleKind, handle: Handle) -> Self {
        self.target = (kind, handle);
        self
    }

    /// Sets the local user's contact.
    #[must_use]
    pub fn with_self(mut self, me: ContactRef) -> Self {
        self.self_handle = me.handle;
        self.contacts.insert(me.handle, me);
        self
    }

    /// Sets the local user's handle without registering a contact for it.
    #[must_use]
    pub const fn with_self_handle(mut self, handle: Handle) -> Self {
        self.self_handle = handle;
        self
    }

    /// Makes `contact` resolvable (room participants, for instance).
    #[must_use]
    pub fn with_contact(mut self, contact: ContactRef) -> Self {
        self.contacts.insert(contact.handle, contact);
        self
    }

    /// Makes room `handle` resolvable as `room_id` without targeting it.
    #[must_use]
    pub fn with_room_entry(mut self, handle: Handle, room_id: impl Into<String>) -> Self {
        self.rooms.insert(handle, room_id.into());
        self
    }

    /// Initial pending queue; its shape decides which fetch is advertised.
    #[must_use]
    pub fn with_pending(mut self, pending: PendingSnapshot) -> Self {
        self.pending = pending;
        self
    }

    /// Refuses subscriptions to `kind`.
    #[must_use]
    pub fn failing_subscribe(mut self, kind: SignalKind) -> Self {
        self.failures.subscribe.insert(kind);
        self
    }

    /// Makes [`TextChannel::prepare`] fail.
    #[must_use]
    pub const fn failing_prepare(mut self) -> Self {
        self.failures.prepare = true;
        self
    }

    /// Makes [`TextChannel::prepare`] never finish.
    #[must_use]
    pub const fn stalling_prepare(mut self) -> Self {
        self.failures.stall_prepare = true;
        self
    }

    /// Makes lookups of `handle` fail.
    #[must_use]
    pub fn failing_contact(mut self, handle: Handle) -> Self {
        self.failures.contacts.insert(handle);
        self
    }

    /// Makes both pending fetches fail.
    #[must_use]
    pub const fn failing_pending_fetch(mut self) -> Self {
        self.failures.pending_fetch = true;
        self
    }

    /// Builds the connected channel and remote.
    #[must_use]
    pub fn build(self) -> (LoopbackChannel, LoopbackRemote) {
        let shared = Arc::new(Shared {
            path: self.path,
            account: self.account,
            target: self.target,
            self_handle: self.self_handle,
            rooms: self.rooms,
            state: Mutex::new(State {
                contacts: self.contacts,
                pending: self.pending,
                subscribers: HashMap::new(),
                failures: self.failures,
                contact_lookups: 0,
            }),
        });
        (
            LoopbackChannel {
                shared: Arc::clone(&shared),
            },
            LoopbackRemote { shared },
        )
    }
}

/// In-process [`TextChannel`].
#[derive(Debug)]
pub struct LoopbackChannel {
    shared: Arc<Shared>,
}

impl LoopbackChannel {
    /// Starts building a channel at `path` owned by `account`.
    ///
    /// The target defaults to an anonymous (`none`) handle and the pending
    /// queue to an empty rich snapshot.
    pub fn builder(path: impl Into<String>, account: impl Into<String>) -> LoopbackBuilder {
        LoopbackBuilder {
            path: ChannelPath::new(path),
            account: AccountPath::new(account),
            target: (HandleKind::None, Handle::new(0)),
            self_handle: Handle::new(1),
            contacts: HashMap::new(),
            rooms: HashMap::new(),
            pending: PendingSnapshot::Rich(Vec::new()),
            failures: Failures::default(),
        }
    }
}

/// The far end of a [`LoopbackChannel`].
#[derive(Debug, Clone)]
pub struct LoopbackRemote {
    shared: Arc<Shared>,
}

impl LoopbackRemote {
    /// Path of the channel this remote drives.
    #[must_use]
    pub fn path(&self) -> &ChannelPath {
        &self.shared.path
    }

    /// Sends `signal` to every live subscriber of its kind.
    ///
    /// Returns how many subscribers accepted it; closed queues are skipped.
    pub async fn emit(&self, signal: ChannelSignal) -> usize {
        let sinks: Vec<_> = {
            let state = self.shared.state.lock();
            state
                .subscribers
                .get(&signal.kind())
                .cloned()
                .unwrap_or_default()
        };
        let mut delivered = 0;
        for sink in sinks {
            if sink.send(signal.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queues `message` as pending and raises `received` for it.
    pub async fn deliver(&self, message: PendingMessage) -> usize {
        {
            let mut state = self.shared.state.lock();
            match &mut state.pending {
                PendingSnapshot::Rich(v) => v.push(to_rich(&message)),
                PendingSnapshot::Legacy(v) => v.push(to_legacy(&message)),
            }
        }
        self.emit(ChannelSignal::Received(message)).await
    }

    /// Drops `ids` from the pending queue and raises the removal signal.
    pub async fn acknowledge(&self, ids: Vec<PendingMessageId>) -> usize {
        {
            let mut state = self.shared.state.lock();
            match &mut state.pending {
                PendingSnapshot::Rich(v) => v.retain(|m| {
                    PendingMessage::try_from(m.clone()).map_or(true, |p| !ids.contains(&p.id))
                }),
                PendingSnapshot::Legacy(v) => {
                    v.retain(|m| !ids.contains(&PendingMessageId::new(m.id)));
                }
            }
        }
        self.emit(ChannelSignal::PendingMessagesRemoved(ids)).await
    }

    /// Raises `closed` and drops every subscription.
    pub async fn close(&self) -> usize {
        let delivered = self.emit(ChannelSignal::Closed).await;
        self.shared.state.lock().subscribers.clear();
        delivered
    }

    /// Replaces the pending queue.
    pub fn set_pending(&self, pending: PendingSnapshot) {
        self.shared.state.lock().pending = pending;
    }

    /// Number of records in the pending queue.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Makes `contact` resolvable from now on.
    pub fn add_contact(&self, contact: ContactRef) {
        self.shared
            .state
            .lock()
            .contacts
            .insert(contact.handle, contact);
    }

    /// Makes lookups of `handle` fail from now on.
    pub fn fail_contact(&self, handle: Handle) {
        self.shared.state.lock().failures.contacts.insert(handle);
    }

    /// Number of open subscriptions for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: SignalKind) -> usize {
        self.shared
            .state
            .lock()
            .subscribers
            .get(&kind)
            .map_or(0, |v| v.iter().filter(|s| !s.is_closed()).count())
    }

    /// How many contact lookups the channel has served.
    #[must_use]
    pub fn contact_lookups(&self) -> usize {
        self.shared.state.lock().contact_lookups
    }
}

impl TextChannel for LoopbackChannel {
    fn path(&self) -> &ChannelPath {
        &self.shared.path
    }

    fn account(&self) -> &AccountPath {
        &self.shared.account
    }

    fn target(&self) -> (HandleKind, Handle) {
        self.shared.target
    }

    fn self_handle(&self) -> Handle {
        self.shared.self_handle
    }

    async fn prepare(&self) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        let (fail, stall) = {
            let state = self.shared.state.lock();
            (state.failures.prepare, state.failures.stall_prepare)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(TransportError::Prepare("loopback refused".to_string()));
        }
        Ok(())
    }

    fn connect_signal(
        &self,
        kind: SignalKind,
        sink: mpsc::Sender<ChannelSignal>,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if state.failures.subscribe.contains(&kind) {
            return Err(TransportError::Subscribe(kind));
        }
        state.subscribers.entry(kind).or_default().push(sink);
        Ok(())
    }

    async fn resolve_contact(&self, handle: Handle) -> Result<ContactRef, TransportError> {
        tokio::task::yield_now().await;
        let mut state = self.shared.state.lock();
        state.contact_lookups += 1;
        if state.failures.contacts.contains(&handle) {
            return Err(TransportError::UnknownHandle(handle));
        }
        state
            .contacts
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownHandle(handle))
    }

    async fn inspect_room(&self, handle: Handle) -> Result<String, TransportError> {
        tokio::task::yield_now().await;
        self.shared
            .rooms
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownHandle(handle))
    }

    fn supports_rich_pending(&self) -> bool {
        matches!(self.shared.state.lock().pending, PendingSnapshot::Rich(_))
    }

    async fn pending_messages_rich(&self) -> Result<Vec<RichPendingMessage>, TransportError> {
        tokio::task::yield_now().await;
        let state = self.shared.state.lock();
        if state.failures.pending_fetch {
            return Err(TransportError::PendingFetch("loopback refused".to_string()));
        }
        Ok(match &state.pending {
            PendingSnapshot::Rich(v) => v.clone(),
            PendingSnapshot::Legacy(v) => v
                .iter()
                .map(|m| to_rich(&PendingMessage::from(m.clone())))
                .collect(),
        })
    }

    async fn pending_messages_legacy(&self) -> Result<Vec<LegacyPendingMessage>, TransportError> {
        tokio::task::yield_now().await;
        let state = self.shared.state.lock();
        if state.failures.pending_fetch {
            return Err(TransportError::PendingFetch("loopback refused".to_string()));
        }
        Ok(match &state.pending {
            PendingSnapshot::Legacy(v) => v.clone(),
            // Malformed rich records have no legacy rendering.
            PendingSnapshot::Rich(v) => v
                .iter()
                .filter_map(|m| PendingMessage::try_from(m.clone()).ok())
                .map(|m| to_legacy(&m))
                .collect(),
        })
    }
}

fn to_rich(message: &PendingMessage) -> RichPendingMessage {
    let mut headers = MessagePart::new();
    headers.insert(
        HEADER_PENDING_ID.to_string(),
        PartValue::UInt(u64::from(message.id.get())),
    );
    headers.insert(
        HEADER_RECEIVED.to_string(),
        PartValue::UInt(u64::try_from(message.timestamp).unwrap_or(0)),
    );
    headers.insert(
        HEADER_SENDER.to_string(),
        PartValue::UInt(u64::from(message.sender.get())),
    );
    headers.insert(
        HEADER_TYPE.to_string(),
        PartValue::UInt(u64::from(u32::from(message.message_type))),
    );
    if message.flags.contains(MessageFlags::RESCUED) {
        headers.insert(HEADER_RESCUED.to_string(), PartValue::Bool(true));
    }
    if message.flags.contains(MessageFlags::SCROLLBACK) {
        headers.insert(HEADER_SCROLLBACK.to_string(), PartValue::Bool(true));
    }

    let mut parts = vec![headers];
    if !message.flags.contains(MessageFlags::NON_TEXT_CONTENT) {
        let mut body = MessagePart::new();
        body.insert(PART_CONTENT.to_string(), PartValue::Text(message.body.clone()));
        parts.push(body);
    }
    RichPendingMessage { parts }
}

fn to_legacy(message: &PendingMessage) -> LegacyPendingMessage {
    LegacyPendingMessage {
        id: message.id.get(),
        timestamp: u32::try_from(message.timestamp).unwrap_or(0),
        sender: message.sender.get(),
        message_type: message.message_type.into(),
        flags: message.flags.bits(),
        text: message.body.clone(),
    }
}
