//! Attach-time reconciliation and the stale sweep.
//!
//! Reconciliation compares the channel's live pending queue with the
//! tokens the index still marks pending for that channel:
//!
//! 1. every live message already pending in the index is left alone;
//! 2. every other live message goes through the ingester (it arrived while
//!    nobody was watching);
//! 3. whatever the index still marks pending afterwards was acknowledged
//!    while unobserved and is acknowledged now.
//!
//! Channels that are never reattached are only covered by
//! [`sweep_stale`], which acknowledges pending entries past the retention
//! window regardless of channel.

use std::collections::BTreeSet;
use std::time::Duration;

use textlog_proto::channel::ChannelPath;
use textlog_proto::pending::PendingSnapshot;
use textlog_proto::token::{MessageToken, tokenize};
use textlog_store::AckStore;

use crate::transport::TextChannel;

use super::{ChannelSession, IngestOutcome};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records in the live snapshot.
    pub seen: usize,
    /// Delivery notifications skipped without tokenizing.
    pub notifications: usize,
    /// Rich records that could not be normalized.
    pub malformed: usize,
    /// Live messages the index already knew about.
    pub already_logged: usize,
    /// Live messages logged by this pass.
    pub logged: usize,
    /// Live messages that could not be logged.
    pub dropped: usize,
    /// Index entries acknowledged because the channel no longer has them.
    pub stale_acknowledged: usize,
    /// Stale entries whose acknowledgment failed.
    pub stale_failed: usize,
    /// Whether the stale pass was skipped for lack of an index listing.
    pub stale_pass_skipped: bool,
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending entries older than the cutoff.
    pub candidates: usize,
    /// Entries acknowledged.
    pub acknowledged: usize,
    /// Entries whose acknowledgment failed.
    pub failed: usize,
}

/// Unix time before which pending entries count as stale.
#[must_use]
pub fn retention_cutoff(now: i64, retention: Duration) -> i64 {
    now.saturating_sub(i64::try_from(retention.as_secs()).unwrap_or(i64::MAX))
}

/// Acknowledges every pending entry older than `older_than`.
///
/// Best effort: failures are logged and counted, never returned.
pub async fn sweep_stale<S: AckStore>(
    store: &S,
    channel: Option<&ChannelPath>,
    older_than: i64,
) -> SweepReport {
    let tokens = match store.log_ids(channel, older_than).await {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::warn!(error = %e, "could not list stale entries");
            return SweepReport::default();
        }
    };

    let mut report = SweepReport {
        candidates: tokens.len(),
        ..SweepReport::default()
    };
    for token in tokens {
        match store.set_acknowledgment(&token).await {
            Ok(()) => report.acknowledged += 1,
            Err(e) => {
                tracing::warn!(%token, error = %e, "could not acknowledge stale entry");
                report.failed += 1;
            }
        }
    }
    report
}

impl<C, S> ChannelSession<C, S>
where
    C: TextChannel + 'static,
    S: AckStore + 'static,
{
    /// Reconciles `snapshot` against the index.
    pub async fn reconcile(&mut self, snapshot: PendingSnapshot) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut persisted: Option<BTreeSet<MessageToken>> =
            match self.store.pending_messages(self.channel.path()).await {
                Ok(tokens) => Some(tokens.into_iter().collect()),
                Err(e) => {
                    tracing::warn!(session = %self.id, channel = %self.channel.path(), error = %e, "could not read pending entries, skipping stale pass");
                    None
                }
            };

        for record in snapshot.normalize() {
            report.seen += 1;
            let message = match record {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(session = %self.id, error = %e, "skipping malformed pending message");
                    report.malformed += 1;
                    continue;
                }
            };
            if message.is_delivery_notification() {
                report.notifications += 1;
                continue;
            }

            let token = tokenize(self.channel.path(), message.timestamp, message.id);
            if persisted.as_mut().is_some_and(|set| set.remove(&token)) {
                tracing::debug!(session = %self.id, %token, "pending message already logged");
                report.already_logged += 1;
                continue;
            }

            match self.ingest_received(&message).await {
                IngestOutcome::Logged(_) => report.logged += 1,
                IngestOutcome::Duplicate(_) => report.already_logged += 1,
                IngestOutcome::Dropped => report.dropped += 1,
                IngestOutcome::Ignored(_) => report.notifications += 1,
                IngestOutcome::Acknowledged(_) => {}
            }
        }

        let Some(stale) = persisted else {
            report.stale_pass_skipped = true;
            return report;
        };
        for token in stale {
            match self.store.set_acknowledgment(&token).await {
                Ok(()) => {
                    tracing::debug!(session = %self.id, %token, "acknowledged stale entry");
                    report.stale_acknowledged += 1;
                }
                Err(e) => {
                    tracing::warn!(session = %self.id, %token, error = %e, "could not acknowledge stale entry");
                    report.stale_failed += 1;
                }
            }
        }
        report
    }
}
