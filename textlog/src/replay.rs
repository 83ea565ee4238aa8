//! JSON-lines replay scripts.
//!
//! A script drives loopback channels through an [`Observer`], one event per
//! line:
//!
//! ```text
//! {"event":"attach","channel":"/ch/1","account":"/acc/1","target":{"kind":"contact","handle":2},
//!  "contacts":[{"handle":1,"identifier":"me@example.com","alias":"Me"},
//!              {"handle":2,"identifier":"bob@example.com","alias":"Bob"}]}
//! {"event":"settle"}
//! {"event":"signal","channel":"/ch/1","signal":{"received":{"id":42,"timestamp":1704067200,"sender":2,"body":"hi"}}}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. When the script
//! ends every channel is closed and the driver waits for all sessions.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use textlog_proto::channel::{AccountPath, ChannelPath, ContactRef, Handle, HandleKind};
use textlog_proto::pending::PendingSnapshot;
use textlog_store::AckStore;

use crate::channel::SessionReport;
use crate::observer::{ObserveError, Observer};
use crate::transport::ChannelSignal;
use crate::transport::loopback::{LoopbackChannel, LoopbackRemote};

/// Errors that stop a replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The script could not be read.
    #[error("failed to read script {path}: {source}")]
    Io {
        /// Script path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A line is not a valid event.
    #[error("line {line}: {source}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Decoding error.
        source: serde_json::Error,
    },

    /// A signal names a channel that was never attached.
    #[error("line {line}: channel {channel} is not attached")]
    UnknownChannel {
        /// 1-based line number.
        line: usize,
        /// The channel named by the event.
        channel: ChannelPath,
    },

    /// Attaching a channel failed.
    #[error("line {line}: {source}")]
    Observe {
        /// 1-based line number.
        line: usize,
        /// Why the attach was rejected.
        source: ObserveError,
    },
}

/// Target handle of an attached channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TargetSpec {
    /// Kind of entity the handle names.
    pub kind: HandleKind,
    /// The handle itself.
    pub handle: Handle,
}

/// A room the channel can resolve.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomSpec {
    /// Room handle.
    pub handle: Handle,
    /// Protocol-level room id.
    pub id: String,
}

/// Everything needed to attach one loopback channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttachSpec {
    /// Channel path.
    pub channel: ChannelPath,
    /// Owning account.
    pub account: AccountPath,
    /// Conversation target.
    pub target: TargetSpec,
    /// Local user's handle.
    #[serde(default = "default_self_handle")]
    pub self_handle: Handle,
    /// Resolvable contacts, including the local user.
    #[serde(default)]
    pub contacts: Vec<ContactRef>,
    /// Resolvable rooms.
    #[serde(default)]
    pub rooms: Vec<RoomSpec>,
    /// Messages already pending when the channel is attached.
    #[serde(default)]
    pub pending: Option<PendingSnapshot>,
}

const fn default_self_handle() -> Handle {
    Handle::new(1)
}

/// One script line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    /// Attach a channel.
    Attach(AttachSpec),
    /// Raise a live signal on an attached channel.
    Signal {
        /// Target channel.
        channel: ChannelPath,
        /// The signal.
        signal: ChannelSignal,
    },
    /// Wait until every attached session has finished preparing.
    Settle,
}

impl AttachSpec {
    fn build(self) -> (LoopbackChannel, LoopbackRemote) {
        let mut builder = LoopbackChannel::builder(self.channel.as_str(), self.account.as_str())
            .with_target(self.target.kind, self.target.handle);
        for contact in self.contacts {
            builder = builder.with_contact(contact);
        }
        for room in self.rooms {
            builder = builder.with_room_entry(room.handle, room.id);
        }
        if let Some(pending) = self.pending {
            builder = builder.with_pending(pending);
        }
        builder.with_self_handle(self.self_handle).build()
    }
}

/// Parses a whole script, skipping blank and `#` lines.
///
/// Returns `(line number, event)` pairs.
///
/// # Errors
///
/// Returns [`ReplayError::Parse`] for the first malformed line.
pub fn parse_script(script: &str) -> Result<Vec<(usize, ReplayEvent)>, ReplayError> {
    script
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line, text)| {
            serde_json::from_str(text)
                .map(|event| (line, event))
                .map_err(|source| ReplayError::Parse { line, source })
        })
        .collect()
}

/// Drives loopback channels from a script.
pub struct Replay<S> {
    observer: Observer<S>,
    remotes: HashMap<ChannelPath, LoopbackRemote>,
}

impl<S: AckStore + 'static> Replay<S> {
    /// Creates a driver attaching channels through `observer`.
    pub fn new(observer: Observer<S>) -> Self {
        Self {
            observer,
            remotes: HashMap::new(),
        }
    }

    /// The observer sessions are attached through.
    pub const fn observer(&self) -> &Observer<S> {
        &self.observer
    }

    /// Reads and runs the script at `path`.
    ///
    /// # Errors
    ///
    /// See [`Replay::run`]; also [`ReplayError::Io`] if the file cannot be
    /// read.
    pub async fn run_file(&mut self, path: &Path) -> Result<Vec<SessionReport>, ReplayError> {
        let script = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.run(&script).await
    }

    /// Runs `script` to the end, closes every channel and collects the
    /// session reports.
    ///
    /// The whole script is parsed before anything runs.
    ///
    /// # Errors
    ///
    /// Returns the first [`ReplayError`]; sessions already attached are
    /// still closed and joined.
    pub async fn run(&mut self, script: &str) -> Result<Vec<SessionReport>, ReplayError> {
        let events = parse_script(script)?;
        let mut outcome = Ok(());
        for (line, event) in events {
            if let Err(e) = self.apply(line, event).await {
                outcome = Err(e);
                break;
            }
        }
        let reports = self.finish().await;
        outcome.map(|()| reports)
    }

    /// Applies one event.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Observe`] for a rejected attach and
    /// [`ReplayError::UnknownChannel`] for a signal on an unattached
    /// channel.
    pub async fn apply(&mut self, line: usize, event: ReplayEvent) -> Result<(), ReplayError> {
        match event {
            ReplayEvent::Attach(spec) => {
                let (channel, remote) = spec.build();
                let path = remote.path().clone();
                self.observer
                    .observe(channel)
                    .map_err(|source| ReplayError::Observe { line, source })?;
                self.remotes.insert(path, remote);
            }
            ReplayEvent::Signal { channel, signal } => {
                let Some(remote) = self.remotes.get(&channel) else {
                    return Err(ReplayError::UnknownChannel { line, channel });
                };
                let delivered = match signal {
                    ChannelSignal::Received(message) => remote.deliver(message).await,
                    ChannelSignal::PendingMessagesRemoved(ids) => remote.acknowledge(ids).await,
                    ChannelSignal::Closed => remote.close().await,
                    other => remote.emit(other).await,
                };
                tracing::debug!(line, channel = %channel, delivered, "replayed signal");
            }
            ReplayEvent::Settle => self.observer.settle().await,
        }
        Ok(())
    }

    /// Closes every channel once its session has settled, then waits for
    /// all sessions.
    pub async fn finish(&mut self) -> Vec<SessionReport> {
        self.observer.settle().await;
        for remote in self.remotes.values() {
            remote.close().await;
        }
        self.remotes.clear();
        self.observer.join_all().await
    }
}
