//! Preparation steps run by a session's [`ActionChain`].
//!
//! Queue order: `connect_signals`, `prepare_channel`, `get_my_contact`,
//! `get_remote_handle_type`, `get_pending_messages`,
//! `cleanup_pending_messages_db`. `get_remote_handle_type` splices in
//! either `get_remote_contact` or `get_chatroom_id` right after itself, or
//! aborts for targets that cannot be logged.

use futures_util::future::BoxFuture;

use textlog_proto::channel::{Handle, HandleKind};
use textlog_proto::pending::PendingSnapshot;
use textlog_store::AckStore;

use crate::chain::{ActionChain, ChainError, Splice, StepOutcome};
use crate::transport::{SignalKind, TextChannel};

use super::{ChannelSession, SessionError, SessionState, reconcile};

type Session<C, S> = ChannelSession<C, S>;
type SessionSplice<C, S> = Splice<ChannelSession<C, S>, SessionError>;
type Outcome<'a> = BoxFuture<'a, StepOutcome<SessionError>>;

/// Queues the fixed preparation steps.
pub(super) fn build_chain<C, S>(
    chain: &mut ActionChain<'_, Session<C, S>, SessionError>,
) -> Result<(), ChainError>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    chain.append("connect_signals", connect_signals, ())?;
    chain.append("prepare_channel", prepare_channel, ())?;
    chain.append("get_my_contact", get_my_contact, ())?;
    chain.append("get_remote_handle_type", get_remote_handle_type, ())?;
    chain.append("get_pending_messages", get_pending_messages, ())?;
    chain.append("cleanup_pending_messages_db", cleanup_pending_messages_db, ())?;
    Ok(())
}

fn connect_signals<'a, C, S>(
    session: &'a mut Session<C, S>,
    (): (),
    _: &'a mut SessionSplice<C, S>,
) -> Outcome<'a>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    Box::pin(async move { StepOutcome::from(session.connect_signals()) })
}

fn prepare_channel<'a, C, S>(
    session: &'a mut Session<C, S>,
    (): (),
    _: &'a mut SessionSplice<C, S>,
) -> Outcome<'a>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    Box::pin(async move {
        let result = session.channel.prepare().await.map_err(SessionError::from);
        if result.is_ok() {
            session.set_state(SessionState::ChannelReady);
        }
        StepOutcome::from(result)
    })
}

fn get_my_contact<'a, C, S>(
    session: &'a mut Session<C, S>,
    (): (),
    _: &'a mut SessionSplice<C, S>,
) -> Outcome<'a>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    Box::pin(async move {
        let handle = session.channel.self_handle();
        let result = match session.channel.resolve_contact(handle).await {
            Ok(me) => session.self_contact.set(me),
            Err(e) => Err(e.into()),
        };
        if result.is_ok() {
            session.set_state(SessionState::SelfResolved);
        }
        StepOutcome::from(result)
    })
}

fn get_remote_handle_type<'a, C, S>(
    session: &'a mut Session<C, S>,
    (): (),
    splice: &'a mut SessionSplice<C, S>,
) -> Outcome<'a>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    Box::pin(async move {
        let (kind, handle) = session.channel.target();
        match kind {
            HandleKind::Contact => {
                session.chatroom = false;
                splice.prepend("get_remote_contact", get_remote_contact, handle);
            }
            HandleKind::Room => {
                session.chatroom = true;
                splice.prepend("get_chatroom_id", get_chatroom_id, handle);
            }
            HandleKind::None | HandleKind::List | HandleKind::Group => {
                tracing::info!(session = %session.id, channel = %session.channel.path(), %kind, "handle kind not logged");
                return StepOutcome::Abort(SessionError::UnsupportedHandleKind(kind));
            }
        }
        session.set_state(SessionState::HandleTypeResolved);
        StepOutcome::Continue
    })
}

fn get_remote_contact<'a, C, S>(
    session: &'a mut Session<C, S>,
    handle: Handle,
    _: &'a mut SessionSplice<C, S>,
) -> Outcome<'a>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    Box::pin(async move {
        let result = match session.channel.resolve_contact(handle).await {
            Ok(peer) => session.remote_contact.set(peer),
            Err(e) => Err(e.into()),
        };
        if result.is_ok() {
            session.set_state(SessionState::PeerResolved);
        }
        StepOutcome::from(result)
    })
}

fn get_chatroom_id<'a, C, S>(
    session: &'a mut Session<C, S>,
    handle: Handle,
    _: &'a mut SessionSplice<C, S>,
) -> Outcome<'a>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    Box::pin(async move {
        let result = match session.channel.inspect_room(handle).await {
            Ok(room_id) => session.chatroom_id.set(room_id),
            Err(e) => Err(e.into()),
        };
        if result.is_ok() {
            session.set_state(SessionState::RoomResolved);
        }
        StepOutcome::from(result)
    })
}

fn get_pending_messages<'a, C, S>(
    session: &'a mut Session<C, S>,
    (): (),
    _: &'a mut SessionSplice<C, S>,
) -> Outcome<'a>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    Box::pin(async move {
        let snapshot = if session.channel.supports_rich_pending() {
            session.channel.pending_messages_rich().await.map(PendingSnapshot::Rich)
        } else {
            session.channel.pending_messages_legacy().await.map(PendingSnapshot::Legacy)
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => return StepOutcome::Abort(e.into()),
        };

        let report = session.reconcile(snapshot).await;
        tracing::info!(
            session = %session.id,
            channel = %session.channel.path(),
            seen = report.seen,
            logged = report.logged,
            stale = report.stale_acknowledged,
            "pending queue reconciled"
        );
        session.reconciled = Some(report);
        session.set_state(SessionState::PendingDrained);
        StepOutcome::Continue
    })
}

/// Store-wide stale sweep. Never aborts.
fn cleanup_pending_messages_db<'a, C, S>(
    session: &'a mut Session<C, S>,
    (): (),
    _: &'a mut SessionSplice<C, S>,
) -> Outcome<'a>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    Box::pin(async move {
        let cutoff = reconcile::retention_cutoff(chrono::Utc::now().timestamp(), session.config.retention);
        let report = reconcile::sweep_stale(session.store.as_ref(), None, cutoff).await;
        if report.candidates > 0 {
            tracing::info!(
                session = %session.id,
                acknowledged = report.acknowledged,
                failed = report.failed,
                "swept stale pending entries"
            );
        }
        StepOutcome::Continue
    })
}

impl<C, S> ChannelSession<C, S>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    /// Routes every signal kind into the session queue.
    ///
    /// The session keeps no sender of its own afterwards, so the queue ends
    /// once the channel drops its subscriptions.
    fn connect_signals(&mut self) -> Result<(), SessionError> {
        let sink = self
            .signal_tx
            .take()
            .ok_or(SessionError::AlreadySet("signal subscriptions"))?;
        for kind in SignalKind::ALL {
            self.channel.connect_signal(kind, sink.clone())?;
        }
        self.set_state(SessionState::SignalsConnected);
        tracing::debug!(session = %self.id, channel = %self.channel.path(), "signals connected");
        Ok(())
    }
}
