//! Deferred request content.
//!
//! [`DeferredContent`] lets an application produce a request body while the
//! request is already being sent. The application [`offer`](DeferredContent::offer)s
//! byte ranges as they become available and [`close`](DeferredContent::close)s
//! the content when done. The transport drains the ranges through the single
//! [`Cursor`], acknowledging each one through the cursor's [`Callback`]
//! implementation once it has been written.
//!
//! [`flush`](DeferredContent::flush) is the only back-pressure mechanism:
//! offers never block, and a producer that wants to bound its memory calls
//! `flush` to wait until everything offered so far has been acknowledged.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::callback::{Callback, NOOP};
use crate::cause::Cause;
use crate::error::{Error, Result};

/// Notified when new content is available or the content is closed.
pub trait ContentListener: Send + Sync {
    fn on_content(&self);
}

impl<F: Fn() + Send + Sync> ContentListener for F {
    fn on_content(&self) {
        self()
    }
}

/// Configuration for [`DeferredContent`].
#[derive(Debug, Clone)]
pub struct DeferredConfig {
    /// Number of chunks the queue holds before it first reallocates.
    pub initial_capacity: usize,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
        }
    }
}

impl DeferredConfig {
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }
}

struct Chunk {
    content: Bytes,
    callback: Box<dyn Callback>,
}

struct State {
    /// Offered, not yet yielded by the cursor.
    queued: VecDeque<Chunk>,
    /// Yielded by the cursor, not yet acknowledged.
    in_flight: VecDeque<Chunk>,
    /// Offered and not yet acknowledged.
    outstanding: usize,
    closed: bool,
    failure: Option<Cause>,
    listener: Option<Arc<dyn ContentListener>>,
}

struct Shared {
    state: Mutex<State>,
    flushed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the content and every chunk not yet acknowledged.
    fn fail(&self, cause: Cause) -> bool {
        let (chunks, listener) = {
            let mut state = self.lock();
            if let Some(failure) = &state.failure {
                failure.add_suppressed(&cause);
                return false;
            }
            state.failure = Some(cause.clone());
            state.closed = true;
            state.outstanding = 0;
            let mut chunks: Vec<Chunk> = state.in_flight.drain(..).collect();
            chunks.extend(state.queued.drain(..));
            self.flushed.notify_all();
            (chunks, state.listener.clone())
        };
        warn!(%cause, chunks = chunks.len(), "deferred content failed");
        for chunk in chunks {
            chunk.callback.failed(cause.clone());
        }
        if let Some(listener) = listener {
            listener.on_content();
        }
        true
    }
}

/// Producer side of a deferred request body.
pub struct DeferredContent {
    shared: Arc<Shared>,
    cursor: Arc<Cursor>,
}

impl Default for DeferredContent {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredContent {
    pub fn new() -> Self {
        Self::with_config(DeferredConfig::default())
    }

    pub fn with_config(config: DeferredConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queued: VecDeque::with_capacity(config.initial_capacity),
                in_flight: VecDeque::new(),
                outstanding: 0,
                closed: false,
                failure: None,
                listener: None,
            }),
            flushed: Condvar::new(),
        });
        let cursor = Arc::new(Cursor {
            shared: shared.clone(),
        });
        Self { shared, cursor }
    }

    /// Register the listener notified on every accepted offer and on close.
    pub fn set_listener(&self, listener: impl ContentListener + 'static) {
        self.shared.lock().listener = Some(Arc::new(listener));
    }

    /// Queue `content`. Returns `false` if the content is closed or failed.
    pub fn offer(&self, content: Bytes) -> bool {
        self.offer_with(content, NOOP)
    }

    /// Queue `content`; `callback` succeeds once the chunk is acknowledged.
    ///
    /// When the content is already closed or failed the chunk is rejected
    /// and `callback` fails right away.
    pub fn offer_with(&self, content: Bytes, callback: impl Callback + 'static) -> bool {
        let mut state = self.shared.lock();
        if state.closed || state.failure.is_some() {
            let cause = state
                .failure
                .clone()
                .unwrap_or_else(|| Cause::msg("deferred content closed"));
            drop(state);
            debug!(%cause, len = content.len(), "offer rejected");
            callback.failed(cause);
            return false;
        }
        trace!(len = content.len(), queued = state.queued.len(), "content offered");
        state.queued.push_back(Chunk {
            content,
            callback: Box::new(callback),
        });
        state.outstanding += 1;
        let listener = state.listener.clone();
        drop(state);
        if let Some(listener) = listener {
            listener.on_content();
        }
        true
    }

    /// No more content will be offered. Idempotent.
    pub fn close(&self) {
        let listener = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.shared.flushed.notify_all();
            state.listener.clone()
        };
        debug!("deferred content closed");
        if let Some(listener) = listener {
            listener.on_content();
        }
    }

    /// Fail the content: pending chunk callbacks fail with `cause`, blocked
    /// flushes return it, and later offers are rejected.
    ///
    /// Returns `false` if the content had already failed.
    pub fn fail(&self, cause: Cause) -> bool {
        self.shared.fail(cause)
    }

    /// Block until every chunk offered so far has been acknowledged.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.shared.lock();
        loop {
            if let Some(failure) = &state.failure {
                return Err(Error::Failed(failure.clone()));
            }
            if state.outstanding == 0 {
                return Ok(());
            }
            trace!(outstanding = state.outstanding, "flush waiting");
            state = self
                .shared
                .flushed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`flush`](Self::flush), giving up after `timeout`.
    pub fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(failure) = &state.failure {
                return Err(Error::Failed(failure.clone()));
            }
            if state.outstanding == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::FlushTimeout(timeout));
            }
            state = self
                .shared
                .flushed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// The single consumer cursor. Every call returns the same cursor.
    pub fn cursor(&self) -> Arc<Cursor> {
        self.cursor.clone()
    }

    /// Deferred content never knows its length up front.
    pub fn length(&self) -> Option<u64> {
        None
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Chunks offered and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }
}

impl fmt::Debug for DeferredContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("DeferredContent")
            .field("queued", &state.queued.len())
            .field("outstanding", &state.outstanding)
            .field("closed", &state.closed)
            .field("failure", &state.failure)
            .finish()
    }
}

/// Consumer side of a [`DeferredContent`].
///
/// Chunks come out in offer order. Each chunk returned by [`next`](Self::next)
/// is acknowledged by calling [`Callback::succeeded`] on the cursor; calling
/// [`Callback::failed`] fails the whole content.
pub struct Cursor {
    shared: Arc<Shared>,
}

impl Cursor {
    /// `false` once the content is closed and every chunk has been yielded.
    pub fn has_next(&self) -> bool {
        let state = self.shared.lock();
        !(state.closed && state.queued.is_empty())
    }

    /// Next chunk, or `None` if nothing has been offered yet.
    ///
    /// Fails with [`Error::NoSuchElement`] once the content is closed and
    /// drained, and with [`Error::Failed`] if the content failed.
    pub fn next(&self) -> Result<Option<Bytes>> {
        let mut state = self.shared.lock();
        if let Some(failure) = &state.failure {
            return Err(Error::Failed(failure.clone()));
        }
        match state.queued.pop_front() {
            Some(chunk) => {
                let content = chunk.content.clone();
                state.in_flight.push_back(chunk);
                Ok(Some(content))
            }
            None if state.closed => Err(Error::NoSuchElement),
            None => Ok(None),
        }
    }
}

impl Callback for Cursor {
    /// Acknowledge the oldest chunk yielded and not yet acknowledged.
    fn succeeded(&self) {
        let chunk = {
            let mut state = self.shared.lock();
            let chunk = state.in_flight.pop_front();
            // released before the chunk callback runs, which may panic
            if chunk.is_some() {
                state.outstanding -= 1;
                if state.outstanding == 0 {
                    self.shared.flushed.notify_all();
                }
            }
            chunk
        };
        match chunk {
            Some(chunk) => chunk.callback.succeeded(),
            None => debug!("acknowledgement without a yielded chunk ignored"),
        }
    }

    fn failed(&self, cause: Cause) {
        self.shared.fail(cause);
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Cursor")
            .field("queued", &state.queued.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}
