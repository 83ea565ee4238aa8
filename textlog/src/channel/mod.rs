//! Per-channel logging session.
//!
//! A [`ChannelSession`] owns one attached channel. It first runs the
//! preparation chain (see [`prepare`]): subscribe to live signals, resolve
//! the local user, resolve the peer or the room, reconcile the channel's
//! pending queue and sweep stale index entries. Once `READY`, it drains its
//! signal queue through the live ingester until the channel closes.
//!
//! Preparation, reconciliation and live ingestion all run sequentially in
//! the session's own task, so the presence check and the insert for one
//! token are never interleaved with other work on that token.

pub mod ingest;
pub mod prepare;
pub mod reconcile;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use textlog_proto::channel::{ChannelPath, ContactRef, Handle, HandleKind};
use textlog_store::AckStore;

use crate::chain::{AbortReason, ActionChain, ChainError, ChainStatus};
use crate::observer::ObservationRegistry;
use crate::transport::{ChannelSignal, TextChannel, TransportError};

pub use ingest::{IngestOutcome, IngestTally};
pub use reconcile::{ReconcileReport, SweepReport};

/// Unique id of one session, attached to its log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new time-ordered session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not started.
    Created,
    /// Every live signal is routed into the session's queue.
    SignalsConnected,
    /// The channel finished its own preparation.
    ChannelReady,
    /// The local user's contact is known.
    SelfResolved,
    /// The target kind is known and supported.
    HandleTypeResolved,
    /// One-to-one: the peer's contact is known.
    PeerResolved,
    /// Chatroom: the room id is known.
    RoomResolved,
    /// The pending queue was reconciled.
    PendingDrained,
    /// Preparation finished; live signals are being logged.
    Ready,
    /// The channel closed after being ready.
    Closed,
    /// Preparation aborted.
    Failed,
}

impl SessionState {
    /// Whether preparation is over, one way or the other.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::Closed | Self::Failed)
    }

    /// Whether the session got past subscribing (or gave up trying).
    #[must_use]
    pub const fn has_subscribed(self) -> bool {
        !matches!(self, Self::Created)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::SignalsConnected => "SIGNALS_CONNECTED",
            Self::ChannelReady => "CHANNEL_READY",
            Self::SelfResolved => "SELF_RESOLVED",
            Self::HandleTypeResolved => "HANDLE_TYPE_RESOLVED",
            Self::PeerResolved => "PEER_RESOLVED",
            Self::RoomResolved => "ROOM_RESOLVED",
            Self::PendingDrained => "PENDING_DRAINED",
            Self::Ready => "READY",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Errors that end a session's preparation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The channel reported a failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The conversation's target kind cannot be logged.
    #[error("unsupported handle kind {0}")]
    UnsupportedHandleKind(HandleKind),

    /// A write-once field was assigned twice.
    #[error("{0} is already set")]
    AlreadySet(&'static str),

    /// An identity needed for logging was never resolved.
    #[error("{0} is not resolved")]
    Unresolved(&'static str),

    /// A preparation step never finished.
    #[error("step {step} stalled after {}s", .after.as_secs())]
    StepStalled {
        /// The stalled step.
        step: &'static str,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The preparation chain could not be built.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Preparation was terminated from outside.
    #[error("session terminated")]
    Terminated,
}

impl From<AbortReason<Self>> for SessionError {
    fn from(reason: AbortReason<Self>) -> Self {
        match reason {
            AbortReason::Step(e) => e,
            AbortReason::Stalled { step, after } => Self::StepStalled { step, after },
            AbortReason::Terminated => Self::Terminated,
        }
    }
}

/// A field that may be assigned exactly once.
#[derive(Debug, Clone)]
pub struct WriteOnce<T> {
    name: &'static str,
    value: Option<T>,
}

impl<T> WriteOnce<T> {
    /// An unset field called `name` in error messages.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name, value: None }
    }

    /// Assigns the value.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadySet`] if a value is already present;
    /// the existing value is kept.
    pub fn set(&mut self, value: T) -> Result<(), SessionError> {
        if self.value.is_some() {
            return Err(SessionError::AlreadySet(self.name));
        }
        self.value = Some(value);
        Ok(())
    }

    /// The value, if assigned.
    #[must_use]
    pub const fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// The value, or [`SessionError::Unresolved`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Unresolved`] if the field was never set.
    pub fn require(&self) -> Result<&T, SessionError> {
        self.value.as_ref().ok_or(SessionError::Unresolved(self.name))
    }
}

/// Tunables shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Per-step watchdog; `None` disables it.
    pub step_timeout: Option<Duration>,
    /// Capacity of the signal queue.
    pub signal_buffer: usize,
    /// Pending entries older than this are acknowledged by the sweep.
    pub retention: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            step_timeout: Some(Duration::from_secs(30)),
            signal_buffer: 256,
            retention: Duration::from_secs(5 * 24 * 60 * 60),
        }
    }
}

/// What a finished session did.
#[derive(Debug)]
pub struct SessionReport {
    /// Session id.
    pub id: SessionId,
    /// Channel the session was attached to.
    pub channel: ChannelPath,
    /// Final state: `CLOSED` or `FAILED`.
    pub state: SessionState,
    /// Why preparation failed, if it did.
    pub error: Option<SessionError>,
    /// Result of the attach-time reconciliation, if it ran.
    pub reconciled: Option<ReconcileReport>,
    /// Outcomes of the live signals handled while ready.
    pub live: IngestTally,
}

/// One attached channel and everything resolved about it.
#[derive(Debug)]
pub struct ChannelSession<C, S> {
    id: SessionId,
    channel: C,
    store: Arc<S>,
    registry: Arc<ObservationRegistry>,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    chatroom: bool,
    chatroom_id: WriteOnce<String>,
    self_contact: WriteOnce<ContactRef>,
    remote_contact: WriteOnce<ContactRef>,
    participants: HashMap<Handle, ContactRef>,
    signal_tx: Option<mpsc::Sender<ChannelSignal>>,
    signal_rx: mpsc::Receiver<ChannelSignal>,
    reconciled: Option<ReconcileReport>,
    live: IngestTally,
}

impl<C, S> ChannelSession<C, S>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    /// Creates a session for `channel` in state `CREATED`.
    pub fn new(
        id: SessionId,
        channel: C,
        store: Arc<S>,
        registry: Arc<ObservationRegistry>,
        config: SessionConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(config.signal_buffer.max(1));
        let (state_tx, _) = watch::channel(SessionState::Created);
        Self {
            id,
            channel,
            store,
            registry,
            config,
            state_tx,
            chatroom: false,
            chatroom_id: WriteOnce::new("chatroom id"),
            self_contact: WriteOnce::new("self contact"),
            remote_contact: WriteOnce::new("remote contact"),
            participants: HashMap::new(),
            signal_tx: Some(signal_tx),
            signal_rx,
            reconciled: None,
            live: IngestTally::default(),
        }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// The attached channel.
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watches state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Whether the channel is a chatroom.
    #[must_use]
    pub const fn is_chatroom(&self) -> bool {
        self.chatroom
    }

    /// Room id, once resolved (chatrooms only).
    #[must_use]
    pub fn chatroom_id(&self) -> Option<&str> {
        self.chatroom_id.get().map(String::as_str)
    }

    /// Local user's contact, once resolved.
    #[must_use]
    pub const fn self_contact(&self) -> Option<&ContactRef> {
        self.self_contact.get()
    }

    /// Peer's contact, once resolved (one-to-one only).
    #[must_use]
    pub const fn remote_contact(&self) -> Option<&ContactRef> {
        self.remote_contact.get()
    }

    /// Result of the attach-time reconciliation, once it ran.
    #[must_use]
    pub const fn reconciled(&self) -> Option<&ReconcileReport> {
        self.reconciled.as_ref()
    }

    fn set_state(&self, state: SessionState) {
        tracing::debug!(session = %self.id, channel = %self.channel.path(), %state, "session state");
        self.state_tx.send_replace(state);
    }

    /// Runs the preparation chain.
    ///
    /// On failure the session is `FAILED` and its channel is unregistered.
    ///
    /// # Errors
    ///
    /// Returns the [`SessionError`] that aborted the chain.
    pub async fn prepare(&mut self) -> Result<(), SessionError> {
        let registry = Arc::clone(&self.registry);
        let path = self.channel.path().clone();
        let id = self.id;
        let watchdog = self.config.step_timeout;

        let mut chain = ActionChain::new(self, move |status: &ChainStatus<SessionError>| {
            if let ChainStatus::Aborted { step, reason } = status {
                tracing::error!(session = %id, channel = %path, step = step.unwrap_or("-"), error = %reason, "channel preparation aborted");
                registry.unregister(&path);
            }
        })
        .with_watchdog(watchdog);
        prepare::build_chain(&mut chain)?;

        match chain.run().await {
            ChainStatus::Completed => {
                self.set_state(SessionState::Ready);
                tracing::info!(session = %self.id, channel = %self.channel.path(), "channel ready");
                Ok(())
            }
            ChainStatus::Aborted { reason, .. } => {
                self.set_state(SessionState::Failed);
                Err(reason.into())
            }
        }
    }

    /// Logs queued signals until `closed` arrives or every sender is gone.
    pub async fn process_signals(&mut self) {
        while let Some(signal) = self.signal_rx.recv().await {
            if matches!(signal, ChannelSignal::Closed) {
                tracing::info!(session = %self.id, channel = %self.channel.path(), "channel closed");
                break;
            }
            let outcome = self.handle_signal(signal).await;
            self.live.record(&outcome);
        }
    }

    /// Prepares the channel, logs it until it closes, then unregisters.
    pub async fn run(mut self) -> SessionReport {
        tracing::info!(session = %self.id, channel = %self.channel.path(), "attaching to channel");
        let error = match self.prepare().await {
            Ok(()) => {
                self.process_signals().await;
                self.set_state(SessionState::Closed);
                self.registry.unregister(self.channel.path());
                None
            }
            Err(e) => Some(e),
        };
        SessionReport {
            id: self.id,
            channel: self.channel.path().clone(),
            state: self.state(),
            error,
            reconciled: self.reconciled,
            live: self.live,
        }
    }
}
