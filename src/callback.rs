//! Single-shot completion callbacks.
//!
//! A [`Callback`] is handed to whoever performs a piece of asynchronous work.
//! The producer of the work completes it exactly once with
//! [`Callback::succeeded`] or [`Callback::failed`]. The consumer may at any
//! time ask for the work to be given up with [`Callback::abort`]; an abort is
//! cooperative: it never completes the callback by itself, it only decides
//! that the eventual completion will be a failure.
//!
//! [`AbstractCallback`] implements the state machine once and reports every
//! transition through the [`CallbackHooks`] extension points:
//!
//! ```text
//!            succeeded()                      on_succeeded, on_completed(None)
//!   Idle ──────────────────────────────▶ Succeeded
//!    │        failed(c)                       on_failed(c), on_completed(c)
//!    ├─────────────────────────────────▶ Failed(c)
//!    │        abort(a)                        on_aborted(a), on_failed(a)
//!    └──────────▶ Aborting(a) ──▶ Aborted(a) ──▶ Failed(a)
//!                                  succeeded() | failed(_): on_completed(a)
//! ```
//!
//! Signals arriving after the outcome is decided are no-ops, except that the
//! cause they carry is recorded as suppressed by the stored cause (see
//! [`Cause::are_associated`]).
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use h2_completion::{callback, Callback, Cause};
//!
//! let done = Arc::new(AtomicBool::new(false));
//! let flag = done.clone();
//! let cb = callback::from_fn(move || flag.store(true, Ordering::SeqCst));
//!
//! assert!(cb.abort(Cause::msg("client went away")));
//! assert!(!done.load(Ordering::SeqCst));
//! cb.succeeded();
//! assert!(done.load(Ordering::SeqCst));
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::cause::Cause;
use crate::error::{Error, Result};

/// A single-shot completion handle with three signals.
pub trait Callback: Send + Sync {
    /// The work completed successfully.
    fn succeeded(&self);

    /// The work failed with `cause`.
    fn failed(&self, cause: Cause);

    /// Ask for the work to be abandoned.
    ///
    /// Returns `true` if this call stored the abort. Implementations that do
    /// not track aborts deliver them as [`failed`](Callback::failed).
    fn abort(&self, cause: Cause) -> bool {
        self.failed(cause);
        true
    }
}

impl<C: Callback + ?Sized> Callback for Arc<C> {
    fn succeeded(&self) {
        (**self).succeeded()
    }

    fn failed(&self, cause: Cause) {
        (**self).failed(cause)
    }

    fn abort(&self, cause: Cause) -> bool {
        (**self).abort(cause)
    }
}

impl<C: Callback + ?Sized> Callback for Box<C> {
    fn succeeded(&self) {
        (**self).succeeded()
    }

    fn failed(&self, cause: Cause) {
        (**self).failed(cause)
    }

    fn abort(&self, cause: Cause) -> bool {
        (**self).abort(cause)
    }
}

/// Extension points of [`AbstractCallback`].
///
/// Each hook runs at most once per callback, after the transition that
/// triggered it has been published. Hooks may call back into their own
/// callback; such calls observe the new state.
pub trait CallbackHooks: Send + Sync {
    /// The callback was aborted. Followed by [`on_failed`](Self::on_failed).
    fn on_aborted(&self, _cause: &Cause) {}

    fn on_succeeded(&self) {}

    fn on_failed(&self, _cause: &Cause) {}

    /// The callback is complete; `None` on success.
    fn on_completed(&self, _cause: Option<&Cause>) {}
}

/// Callback state machine driving a set of [`CallbackHooks`].
///
/// Every state change is one short critical section on a single state enum;
/// hooks run after the lock is released.
pub struct AbstractCallback<H> {
    state: Mutex<State>,
    hooks: H,
}

#[derive(Debug)]
enum State {
    Idle,
    /// Abort hooks are running; `completing` records a natural signal that
    /// arrived meanwhile.
    Aborting { cause: Cause, completing: bool },
    Aborted(Cause),
    Succeeded,
    Failed(Cause),
}

enum Action {
    Ignore,
    Succeed,
    Fail,
    Abort,
    Complete(Cause),
    Suppress(Cause),
}

impl<H: CallbackHooks> AbstractCallback<H> {
    pub fn new(hooks: H) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// True while the callback is aborted and not yet completed.
    pub fn is_aborted(&self) -> bool {
        matches!(
            *self.lock(),
            State::Aborting { .. } | State::Aborted(_)
        )
    }

    /// True once `on_completed` is due or has run.
    pub fn is_completed(&self) -> bool {
        matches!(*self.lock(), State::Succeeded | State::Failed(_))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the current state under the lock and publish the result.
    fn transition<T>(&self, f: impl FnOnce(State) -> (State, T)) -> T {
        let mut state = self.lock();
        let current = std::mem::replace(&mut *state, State::Idle);
        let (next, outcome) = f(current);
        *state = next;
        outcome
    }

    fn run(&self, action: Action, late: Option<&Cause>) {
        match action {
            Action::Ignore => debug!("signal ignored"),
            Action::Succeed => {
                trace!("callback succeeded");
                self.hooks.on_succeeded();
                self.hooks.on_completed(None);
            }
            Action::Fail => {
                if let Some(cause) = late {
                    trace!(%cause, "callback failed");
                    self.hooks.on_failed(cause);
                    self.hooks.on_completed(Some(cause));
                }
            }
            Action::Complete(cause) => {
                if let Some(late) = late {
                    cause.add_suppressed(late);
                }
                trace!(%cause, "aborted callback completed");
                self.hooks.on_completed(Some(&cause));
            }
            Action::Suppress(cause) => {
                if let Some(late) = late {
                    debug!(%cause, %late, "late cause suppressed");
                    cause.add_suppressed(late);
                }
            }
            Action::Abort => {}
        }
    }
}

impl<H: CallbackHooks> Callback for AbstractCallback<H> {
    fn succeeded(&self) {
        let action = self.transition(|state| match state {
            State::Idle => (State::Succeeded, Action::Succeed),
            // the aborting thread completes the callback
            State::Aborting { cause, .. } => (
                State::Aborting {
                    cause,
                    completing: true,
                },
                Action::Ignore,
            ),
            State::Aborted(cause) => (State::Failed(cause.clone()), Action::Complete(cause)),
            terminal => (terminal, Action::Ignore),
        });
        self.run(action, None);
    }

    fn failed(&self, cause: Cause) {
        let action = self.transition(|state| match state {
            State::Idle => (State::Failed(cause.clone()), Action::Fail),
            State::Aborting { cause: abort, .. } => (
                State::Aborting {
                    cause: abort.clone(),
                    completing: true,
                },
                Action::Suppress(abort),
            ),
            State::Aborted(abort) => (State::Failed(abort.clone()), Action::Complete(abort)),
            State::Failed(terminal) => (State::Failed(terminal.clone()), Action::Suppress(terminal)),
            State::Succeeded => (State::Succeeded, Action::Ignore),
        });
        self.run(action, Some(&cause));
    }

    fn abort(&self, cause: Cause) -> bool {
        let action = self.transition(|state| match state {
            State::Idle => (
                State::Aborting {
                    cause: cause.clone(),
                    completing: false,
                },
                Action::Abort,
            ),
            State::Aborting { cause: abort, completing } => (
                State::Aborting {
                    cause: abort.clone(),
                    completing,
                },
                Action::Suppress(abort),
            ),
            State::Aborted(abort) => (State::Aborted(abort.clone()), Action::Suppress(abort)),
            State::Failed(terminal) => (State::Failed(terminal.clone()), Action::Suppress(terminal)),
            State::Succeeded => (State::Succeeded, Action::Ignore),
        });
        if !matches!(action, Action::Abort) {
            self.run(action, Some(&cause));
            return false;
        }

        trace!(%cause, "callback aborted");
        // leave Aborting even if a hook panics, then let the panic go on
        let aborted = panic::catch_unwind(AssertUnwindSafe(|| self.hooks.on_aborted(&cause)));
        let failed = panic::catch_unwind(AssertUnwindSafe(|| self.hooks.on_failed(&cause)));

        let completing = self.transition(|state| match state {
            State::Aborting {
                cause,
                completing: true,
            } => (State::Failed(cause), true),
            State::Aborting { cause, .. } => (State::Aborted(cause), false),
            other => (other, false),
        });
        if completing {
            trace!(%cause, "aborted callback completed");
            self.hooks.on_completed(Some(&cause));
        }
        if let Err(payload) = aborted.and(failed) {
            debug!(%cause, "abort hook panicked");
            panic::resume_unwind(payload);
        }
        true
    }
}

impl<H> fmt::Debug for AbstractCallback<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("AbstractCallback")
            .field("state", &*state)
            .finish()
    }
}

/// A callback that ignores every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

/// Shared [`Noop`] instance.
pub const NOOP: Noop = Noop;

impl Callback for Noop {
    fn succeeded(&self) {}

    fn failed(&self, _cause: Cause) {}

    fn abort(&self, _cause: Cause) -> bool {
        false
    }
}

/// Pass-through holder of another callback.
///
/// Types that augment a callback embed a `Nested` and delegate the signals
/// they do not override to it.
#[derive(Debug, Clone)]
pub struct Nested<C> {
    callback: C,
}

impl<C: Callback> Nested<C> {
    pub fn new(callback: C) -> Self {
        Self { callback }
    }

    pub fn callback(&self) -> &C {
        &self.callback
    }

    pub fn into_inner(self) -> C {
        self.callback
    }
}

impl<C: Callback> Callback for Nested<C> {
    fn succeeded(&self) {
        self.callback.succeeded()
    }

    fn failed(&self, cause: Cause) {
        self.callback.failed(cause)
    }

    fn abort(&self, cause: Cause) -> bool {
        self.callback.abort(cause)
    }
}

/// Callback forwarding every signal to two callbacks, first then second.
#[derive(Debug, Clone)]
pub struct Combined<A, B> {
    first: A,
    second: B,
}

/// Combine two callbacks into one that signals `a` then `b`.
pub fn combine<A: Callback, B: Callback>(a: A, b: B) -> Combined<A, B> {
    Combined {
        first: a,
        second: b,
    }
}

impl<A: Callback, B: Callback> Callback for Combined<A, B> {
    fn succeeded(&self) {
        self.first.succeeded();
        self.second.succeeded();
    }

    fn failed(&self, cause: Cause) {
        self.first.failed(cause.clone());
        self.second.failed(cause);
    }

    fn abort(&self, cause: Cause) -> bool {
        let first = self.first.abort(cause.clone());
        let second = self.second.abort(cause);
        first || second
    }
}

struct FnHooks<S, A, F, C> {
    on_success: S,
    on_abort: A,
    on_failure: F,
    on_completed: C,
}

impl<S, A, F, C> CallbackHooks for FnHooks<S, A, F, C>
where
    S: Fn() + Send + Sync,
    A: Fn(&Cause) + Send + Sync,
    F: Fn(&Cause) + Send + Sync,
    C: Fn(Option<&Cause>) + Send + Sync,
{
    fn on_aborted(&self, cause: &Cause) {
        (self.on_abort)(cause)
    }

    fn on_succeeded(&self) {
        (self.on_success)()
    }

    fn on_failed(&self, cause: &Cause) {
        (self.on_failure)(cause)
    }

    fn on_completed(&self, cause: Option<&Cause>) {
        (self.on_completed)(cause)
    }
}

/// Callback running `on_complete` when it completes, whatever the outcome.
///
/// An abort alone does not run it; the completion that follows does.
pub fn from_fn<F>(on_complete: F) -> impl Callback
where
    F: Fn() + Send + Sync + 'static,
{
    with_abort_and_completion(|| {}, |_| {}, |_| {}, move |_| on_complete())
}

/// Stateless callback forwarding every signal to one of two closures.
///
/// There is no abort memory: `abort(c)` is `failed(c)`, and a later
/// `succeeded()` still runs `on_success`.
pub fn from_fns<S, F>(on_success: S, on_failure: F) -> impl Callback
where
    S: Fn() + Send + Sync + 'static,
    F: Fn(&Cause) + Send + Sync + 'static,
{
    FromFns {
        on_success,
        on_failure,
    }
}

struct FromFns<S, F> {
    on_success: S,
    on_failure: F,
}

impl<S, F> Callback for FromFns<S, F>
where
    S: Fn() + Send + Sync,
    F: Fn(&Cause) + Send + Sync,
{
    fn succeeded(&self) {
        (self.on_success)()
    }

    fn failed(&self, cause: Cause) {
        (self.on_failure)(&cause)
    }
}

/// Callback with abort memory: after an abort, `on_failure` has already run
/// and a later `succeeded()` does not run `on_success`.
pub fn with_abort<S, A, F>(on_success: S, on_abort: A, on_failure: F) -> impl Callback
where
    S: Fn() + Send + Sync + 'static,
    A: Fn(&Cause) + Send + Sync + 'static,
    F: Fn(&Cause) + Send + Sync + 'static,
{
    with_abort_and_completion(on_success, on_abort, on_failure, |_| {})
}

pub fn with_completion<S, F, C>(on_success: S, on_failure: F, on_completed: C) -> impl Callback
where
    S: Fn() + Send + Sync + 'static,
    F: Fn(&Cause) + Send + Sync + 'static,
    C: Fn(Option<&Cause>) + Send + Sync + 'static,
{
    with_abort_and_completion(on_success, |_| {}, on_failure, on_completed)
}

pub fn with_abort_and_completion<S, A, F, C>(
    on_success: S,
    on_abort: A,
    on_failure: F,
    on_completed: C,
) -> impl Callback
where
    S: Fn() + Send + Sync + 'static,
    A: Fn(&Cause) + Send + Sync + 'static,
    F: Fn(&Cause) + Send + Sync + 'static,
    C: Fn(Option<&Cause>) + Send + Sync + 'static,
{
    AbstractCallback::new(FnHooks {
        on_success,
        on_abort,
        on_failure,
        on_completed,
    })
}

/// Run `before` on completion, then forward the signal to `callback`.
pub fn run_before<F, C>(before: F, callback: C) -> impl Callback
where
    F: Fn() + Send + Sync + 'static,
    C: Callback + 'static,
{
    RunBefore {
        before,
        nested: Nested::new(callback),
    }
}

struct RunBefore<F, C> {
    before: F,
    nested: Nested<C>,
}

impl<F, C> Callback for RunBefore<F, C>
where
    F: Fn() + Send + Sync,
    C: Callback,
{
    fn succeeded(&self) {
        (self.before)();
        self.nested.succeeded();
    }

    fn failed(&self, cause: Cause) {
        (self.before)();
        self.nested.failed(cause);
    }

    fn abort(&self, cause: Cause) -> bool {
        self.nested.abort(cause)
    }
}

/// Forward the signal to `callback`, then run `after` on completion.
pub fn run_after<C, F>(callback: C, after: F) -> impl Callback
where
    C: Callback + 'static,
    F: Fn() + Send + Sync + 'static,
{
    RunAfter {
        nested: Nested::new(callback),
        after,
    }
}

struct RunAfter<C, F> {
    nested: Nested<C>,
    after: F,
}

impl<C, F> Callback for RunAfter<C, F>
where
    C: Callback,
    F: Fn() + Send + Sync,
{
    fn succeeded(&self) {
        self.nested.succeeded();
        (self.after)();
    }

    fn failed(&self, cause: Cause) {
        self.nested.failed(cause);
        (self.after)();
    }

    fn abort(&self, cause: Cause) -> bool {
        self.nested.abort(cause)
    }
}

/// A callback a thread can block on until it completes.
///
/// Aborts fail the blocker immediately, so a blocked thread is released as
/// soon as the work is abandoned.
#[derive(Debug, Default)]
pub struct Blocker {
    outcome: Mutex<Option<std::result::Result<(), Cause>>>,
    completed: Condvar,
}

impl Blocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the outcome.
    pub fn block(&self) -> Result<()> {
        let mut outcome = self.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone().map_err(Error::Failed);
            }
            outcome = self
                .completed
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait at most `timeout` for the outcome.
    pub fn block_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone().map_err(Error::Failed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            outcome = self
                .completed
                .wait_timeout(outcome, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn is_done(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<std::result::Result<(), Cause>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, result: std::result::Result<(), Cause>) {
        let mut outcome = self.lock();
        match outcome.as_ref() {
            None => {
                *outcome = Some(result);
                self.completed.notify_all();
            }
            Some(Err(terminal)) => {
                if let Err(late) = &result {
                    terminal.add_suppressed(late);
                }
            }
            Some(Ok(())) => {}
        }
    }
}

impl Callback for Blocker {
    fn succeeded(&self) {
        self.complete(Ok(()));
    }

    fn failed(&self, cause: Cause) {
        self.complete(Err(cause));
    }
}
