//! Sequential executor for asynchronous preparation steps.
//!
//! An [`ActionChain`] runs a queue of steps against one owner, one at a
//! time. A step is an async function that returns a [`StepOutcome`]; the
//! chain, not the step, decides whether to move on. A running step can
//! splice follow-up steps in directly after itself through its [`Splice`]
//! handle, which is how data-dependent branches are expressed.
//!
//! The completion callback fires exactly once: with
//! [`ChainStatus::Completed`] when the queue runs dry, or with
//! [`ChainStatus::Aborted`] when a step aborts, stalls past the watchdog, or
//! the chain is terminated from outside. Nothing runs after that.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;

/// Signature of a chain step carrying a payload of type `D`.
pub type StepFn<O, D, E> =
    for<'a> fn(&'a mut O, D, &'a mut Splice<O, E>) -> BoxFuture<'a, StepOutcome<E>>;

type ErasedStep<O, E> = Box<
    dyn for<'a> FnOnce(&'a mut O, &'a mut Splice<O, E>) -> BoxFuture<'a, StepOutcome<E>> + Send,
>;

fn erase<O, E, F>(f: F) -> ErasedStep<O, E>
where
    F: for<'a> FnOnce(&'a mut O, &'a mut Splice<O, E>) -> BoxFuture<'a, StepOutcome<E>>
        + Send
        + 'static,
{
    Box::new(f)
}

struct QueuedStep<O, E> {
    name: &'static str,
    run: ErasedStep<O, E>,
}

impl<O: 'static, E: 'static> QueuedStep<O, E> {
    fn new<D: Send + 'static>(name: &'static str, func: StepFn<O, D, E>, data: D) -> Self {
        Self {
            name,
            run: erase(move |owner, splice| func(owner, data, splice)),
        }
    }
}

/// What a step reports back to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<E> {
    /// Run the next queued step.
    Continue,
    /// Stop the chain with this reason.
    Abort(E),
}

impl<E> From<Result<(), E>> for StepOutcome<E> {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Continue,
            Err(e) => Self::Abort(e),
        }
    }
}

/// Why a chain stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason<E> {
    /// A step returned [`StepOutcome::Abort`].
    Step(E),
    /// A step did not finish within the watchdog deadline.
    Stalled {
        /// The stalled step.
        step: &'static str,
        /// The deadline that elapsed.
        after: Duration,
    },
    /// [`ActionChain::terminate`] was called.
    Terminated,
}

impl<E: fmt::Display> fmt::Display for AbortReason<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(e) => write!(f, "{e}"),
            Self::Stalled { step, after } => {
                write!(f, "step {step} stalled after {}s", after.as_secs())
            }
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// Final status of a chain, passed to the completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus<E> {
    /// Every queued step ran and continued.
    Completed,
    /// The chain stopped before its queue was empty.
    Aborted {
        /// The step that was running, if any.
        step: Option<&'static str>,
        /// Why the chain stopped.
        reason: AbortReason<E>,
    },
}

impl<E> ChainStatus<E> {
    /// Whether the chain ran to completion.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Errors from building a chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Steps can only be appended before the chain first advances.
    #[error("chain has already started")]
    Started,
}

/// Handle through which a running step queues steps right after itself.
///
/// Staged steps are inserted, in staging order, only if the running step
/// continues; they are discarded if it aborts.
pub struct Splice<O, E> {
    staged: Vec<QueuedStep<O, E>>,
}

impl<O: 'static, E: 'static> Splice<O, E> {
    /// Stages `func` to run immediately after the current step.
    pub fn prepend<D: Send + 'static>(&mut self, name: &'static str, func: StepFn<O, D, E>, data: D) {
        self.staged.push(QueuedStep::new(name, func, data));
    }
}

impl<O, E> fmt::Debug for Splice<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.staged.iter().map(|s| s.name).collect();
        f.debug_struct("Splice").field("staged", &names).finish()
    }
}

type Completion<'o, E> = Box<dyn FnOnce(&ChainStatus<E>) + Send + 'o>;

/// Ordered queue of async steps run against one owner.
pub struct ActionChain<'o, O, E> {
    owner: &'o mut O,
    queue: VecDeque<QueuedStep<O, E>>,
    on_complete: Option<Completion<'o, E>>,
    watchdog: Option<Duration>,
    started: bool,
    executed: usize,
    status: Option<ChainStatus<E>>,
}

impl<'o, O: 'static, E: 'static> ActionChain<'o, O, E> {
    /// Creates an empty chain over `owner`.
    ///
    /// `on_complete` is invoked exactly once, when the chain finishes.
    pub fn new(owner: &'o mut O, on_complete: impl FnOnce(&ChainStatus<E>) + Send + 'o) -> Self {
        Self {
            owner,
            queue: VecDeque::new(),
            on_complete: Some(Box::new(on_complete)),
            watchdog: None,
            started: false,
            executed: 0,
            status: None,
        }
    }

    /// Aborts any single step that runs longer than `limit`.
    #[must_use]
    pub const fn with_watchdog(mut self, limit: Option<Duration>) -> Self {
        self.watchdog = limit;
        self
    }

    /// Queues `func` at the tail of the chain.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Started`] once the chain has advanced.
    pub fn append<D: Send + 'static>(
        &mut self,
        name: &'static str,
        func: StepFn<O, D, E>,
        data: D,
    ) -> Result<(), ChainError> {
        if self.started || self.status.is_some() {
            return Err(ChainError::Started);
        }
        self.queue.push_back(QueuedStep::new(name, func, data));
        Ok(())
    }

    /// Number of steps that have run to an outcome.
    #[must_use]
    pub const fn executed(&self) -> usize {
        self.executed
    }

    /// Number of steps still queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Final status, once the chain has finished.
    #[must_use]
    pub const fn status(&self) -> Option<&ChainStatus<E>> {
        self.status.as_ref()
    }

    /// Runs the next queued step, or completes the chain if none remain.
    ///
    /// Does nothing once the chain has finished.
    pub async fn advance(&mut self) {
        if self.status.is_some() {
            return;
        }
        self.started = true;

        let Some(step) = self.queue.pop_front() else {
            self.finish(ChainStatus::Completed);
            return;
        };

        tracing::debug!(step = step.name, "running chain step");
        let mut splice = Splice { staged: Vec::new() };
        let fut = (step.run)(&mut *self.owner, &mut splice);
        let outcome = match self.watchdog {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(step = step.name, limit_secs = limit.as_secs(), "chain step stalled");
                    self.finish(ChainStatus::Aborted {
                        step: Some(step.name),
                        reason: AbortReason::Stalled {
                            step: step.name,
                            after: limit,
                        },
                    });
                    return;
                }
            },
            None => fut.await,
        };
        self.executed += 1;

        match outcome {
            StepOutcome::Continue => {
                for staged in splice.staged.into_iter().rev() {
                    self.queue.push_front(staged);
                }
            }
            StepOutcome::Abort(reason) => self.finish(ChainStatus::Aborted {
                step: Some(step.name),
                reason: AbortReason::Step(reason),
            }),
        }
    }

    /// Stops the chain; queued steps never run.
    pub fn terminate(&mut self) {
        if self.status.is_none() {
            self.finish(ChainStatus::Aborted {
                step: None,
                reason: AbortReason::Terminated,
            });
        }
    }

    /// Advances until the chain finishes and returns its final status.
    pub async fn run(mut self) -> ChainStatus<E> {
        loop {
            if let Some(status) = self.status.take() {
                return status;
            }
            self.advance().await;
        }
    }

    fn finish(&mut self, status: ChainStatus<E>) {
        self.queue.clear();
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&status);
        }
        self.status = Some(status);
    }
}
