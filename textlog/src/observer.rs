//! Channel observation: which channels are attached, and the tasks that log
//! them.
//!
//! The [`ObservationRegistry`] is the single record of attached channels.
//! Sessions remove themselves from it when they fail or close, so a path
//! that is no longer registered can be attached again. The [`Observer`]
//! owns the registry, the shared store and the spawned session tasks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use textlog_proto::channel::ChannelPath;
use textlog_store::AckStore;

use crate::channel::{ChannelSession, SessionConfig, SessionId, SessionReport, SessionState};
use crate::transport::TextChannel;

/// Errors raised when attaching a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserveError {
    /// The channel already has a live session.
    #[error("channel {0} is already observed")]
    AlreadyObserved(ChannelPath),
}

/// Channels with a live session, keyed by path.
#[derive(Debug, Default)]
pub struct ObservationRegistry {
    observed: Mutex<HashMap<ChannelPath, SessionId>>,
}

impl ObservationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `path` as observed by session `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ObserveError::AlreadyObserved`] if `path` is registered.
    pub fn register(&self, path: ChannelPath, id: SessionId) -> Result<(), ObserveError> {
        let mut observed = self.observed.lock();
        if observed.contains_key(&path) {
            return Err(ObserveError::AlreadyObserved(path));
        }
        tracing::debug!(channel = %path, session = %id, "channel registered");
        observed.insert(path, id);
        drop(observed);
        Ok(())
    }

    /// Forgets `path`, returning the session that observed it.
    pub fn unregister(&self, path: &ChannelPath) -> Option<SessionId> {
        let removed = self.observed.lock().remove(path);
        if let Some(id) = removed {
            tracing::debug!(channel = %path, session = %id, "channel unregistered");
        }
        removed
    }

    /// Whether `path` currently has a live session.
    #[must_use]
    pub fn is_observed(&self, path: &ChannelPath) -> bool {
        self.observed.lock().contains_key(path)
    }

    /// Every observed channel, sorted by path.
    #[must_use]
    pub fn observed(&self) -> Vec<(ChannelPath, SessionId)> {
        let mut all: Vec<_> = self
            .observed
            .lock()
            .iter()
            .map(|(path, id)| (path.clone(), *id))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

/// A spawned session.
#[derive(Debug)]
struct SessionHandle {
    id: SessionId,
    path: ChannelPath,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<SessionReport>,
}

/// Attaches channels and runs one session task per channel.
pub struct Observer<S> {
    store: Arc<S>,
    registry: Arc<ObservationRegistry>,
    config: SessionConfig,
    sessions: Vec<SessionHandle>,
}

impl<S: AckStore + 'static> Observer<S> {
    /// Creates an observer logging into `store`.
    pub fn new(store: Arc<S>, config: SessionConfig) -> Self {
        Self {
            store,
            registry: Arc::new(ObservationRegistry::new()),
            config,
            sessions: Vec::new(),
        }
    }

    /// The registry of attached channels.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ObservationRegistry> {
        &self.registry
    }

    /// The shared store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Attaches `channel` and spawns its session.
    ///
    /// # Errors
    ///
    /// Returns [`ObserveError::AlreadyObserved`] if the channel already has
    /// a live session.
    pub fn observe<C: TextChannel + 'static>(&mut self, channel: C) -> Result<SessionId, ObserveError> {
        let id = SessionId::new();
        let path = channel.path().clone();
        self.registry.register(path.clone(), id)?;

        let session = ChannelSession::new(
            id,
            channel,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.clone(),
        );
        let state = session.subscribe_state();
        let task = tokio::spawn(session.run());
        tracing::info!(session = %id, channel = %path, "observing channel");

        self.sessions.push(SessionHandle {
            id,
            path,
            state,
            task,
        });
        Ok(id)
    }

    /// Number of sessions spawned and not yet joined.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Current state of session `id`, if it was spawned by this observer.
    #[must_use]
    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions
            .iter()
            .find(|s| s.id == id)
            .map(|s| *s.state.borrow())
    }

    /// Waits until session `id` has subscribed to its channel's signals.
    ///
    /// Returns the state it was in at that point, or `None` for an unknown
    /// session.
    pub async fn wait_subscribed(&self, id: SessionId) -> Option<SessionState> {
        let handle = self.sessions.iter().find(|s| s.id == id)?;
        let mut rx = handle.state.clone();
        let state = rx
            .wait_for(|s| s.has_subscribed())
            .await
            .map_or(SessionState::Closed, |s| *s);
        Some(state)
    }

    /// Waits until every session has finished preparing.
    pub async fn settle(&self) {
        for handle in &self.sessions {
            let mut rx = handle.state.clone();
            if rx.wait_for(|s| s.is_settled()).await.is_err() {
                tracing::debug!(session = %handle.id, channel = %handle.path, "session ended before settling");
            }
        }
    }

    /// Waits for every session to end and collects their reports.
    ///
    /// Sessions end when their channel closes or preparation fails.
    pub async fn join_all(&mut self) -> Vec<SessionReport> {
        let mut reports = Vec::with_capacity(self.sessions.len());
        for handle in self.sessions.drain(..) {
            match handle.task.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(session = %handle.id, channel = %handle.path, error = %e, "session task failed");
                    self.registry.unregister(&handle.path);
                }
            }
        }
        reports
    }
}
