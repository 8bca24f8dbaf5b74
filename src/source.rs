//! The source protocol and its registration machinery.
//!
//! An event source is anything implementing [`EventSource`]: it reports
//! whether it is ready, hints the loop's sleep bound, optionally names a
//! descriptor to watch, and consumes its pending event data into typed
//! events. Registration pairs a source with a trigger callback and erases
//! the pair behind the internal dispatch trait, following the dispatcher
//! pattern: the loop only ever sees `Arc<SourceEntry>`.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::sys::{Readiness, Watch};

/// Returned by a trigger callback to decide the fate of its source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PostAction {
    /// Keep the source registered; it will fire again when next ready.
    Continue,

    /// Close the source. The loop drops it on the next collection pass and
    /// the trigger is never invoked again.
    Remove,
}

/// A source of events to be inserted into a main loop.
///
/// Implementors describe one interest (a timer, a descriptor, a signal set,
/// an always-ready idle slot) and how its raw readiness data becomes typed
/// events. The loop drives the protocol: `poll_ready` and `timeout` during
/// collection, `mark_fd_ready` after the multiplexer returns, and `consume`
/// during dispatch, strictly in that order.
pub trait EventSource: Send {
    /// The type of events generated by this source
    type Event;

    /// The subtype's own readiness poll.
    ///
    /// May latch internal state: the timeout source flips to ready here and
    /// simultaneously advances its deadline. Once this returns `true` the
    /// source stays ready until `consume` runs.
    fn poll_ready(&mut self, now: Instant) -> bool;

    /// How long the loop may sleep before this source needs attention.
    ///
    /// `None` contributes no bound; `Some(Duration::ZERO)` degenerates the
    /// multiplexer wait into a non-blocking poll.
    fn timeout(&self, now: Instant) -> Option<Duration>;

    /// The descriptor this source wants watched, if any.
    fn watch(&self) -> Option<Watch> {
        None
    }

    /// Record descriptor readiness observed by the multiplexer.
    fn mark_fd_ready(&mut self, readiness: Readiness) {
        let _ = readiness;
    }

    /// Consume pending event data, feeding typed events to `callback`.
    ///
    /// Invoked only when the source is ready. After it returns the source
    /// is no longer ready until the next readiness event. The returned
    /// action is combined with the callback's: `Remove` from either side
    /// closes the source.
    fn consume<F>(&mut self, callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event) -> PostAction;

    /// Release resources owned by the source: descriptors, signal traps.
    ///
    /// Called exactly once, when the loop drops the closed source.
    fn on_close(&mut self) {}
}

/// Object-safe erasure of an `(EventSource, callback)` pair.
pub(crate) trait Dispatch: Send {
    fn poll_ready(&mut self, now: Instant) -> bool;
    fn timeout(&self, now: Instant) -> Option<Duration>;
    fn watch(&self) -> Option<Watch>;
    fn mark_fd_ready(&mut self, readiness: Readiness);
    fn dispatch(&mut self) -> io::Result<PostAction>;
    fn on_close(&mut self);
}

struct Dispatcher<S, F> {
    source: S,
    callback: F,
}

impl<S, F> Dispatch for Dispatcher<S, F>
where
    S: EventSource,
    F: FnMut(S::Event) -> PostAction + Send,
{
    fn poll_ready(&mut self, now: Instant) -> bool {
        self.source.poll_ready(now)
    }

    fn timeout(&self, now: Instant) -> Option<Duration> {
        self.source.timeout(now)
    }

    fn watch(&self) -> Option<Watch> {
        self.source.watch()
    }

    fn mark_fd_ready(&mut self, readiness: Readiness) {
        self.source.mark_fd_ready(readiness);
    }

    fn dispatch(&mut self) -> io::Result<PostAction> {
        let callback = &mut self.callback;
        self.source.consume(|event| (callback)(event))
    }

    fn on_close(&mut self) {
        self.source.on_close();
    }
}

/// A registered source, shared between the loop and the user handle.
pub(crate) struct SourceEntry {
    /// Monotonic: once set it never clears. The loop removes the entry on
    /// the next collection pass.
    closed: AtomicBool,

    /// Guards the one-shot `on_close` of the erased source.
    cleaned: AtomicBool,

    inner: Mutex<Box<dyn Dispatch>>,
}

impl SourceEntry {
    pub(crate) fn new<S, F>(source: S, callback: F) -> Arc<SourceEntry>
    where
        S: EventSource + 'static,
        F: FnMut(S::Event) -> PostAction + Send + 'static,
    {
        Arc::new(SourceEntry {
            closed: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            inner: Mutex::new(Box::new(Dispatcher { source, callback })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Dispatch>> {
        // The only panic that can happen under this lock is caught before
        // it unwinds through the guard, so poisoning cannot leave corrupted
        // state behind.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn poll_ready(&self, now: Instant) -> bool {
        self.lock().poll_ready(now)
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        self.lock().timeout(now)
    }

    pub(crate) fn watch(&self) -> Option<Watch> {
        self.lock().watch()
    }

    pub(crate) fn mark_fd_ready(&self, readiness: Readiness) {
        self.lock().mark_fd_ready(readiness);
    }

    /// Invoke the trigger for a ready source.
    ///
    /// Runs with the registry lock released, so the callback may re-enter
    /// the loop's registration API. A callback panic is contained here: the
    /// source is closed, the loop keeps running.
    pub(crate) fn dispatch(&self) {
        let result = {
            let mut guard = self.lock();
            catch_unwind(AssertUnwindSafe(|| guard.dispatch()))
        };
        match result {
            Ok(Ok(PostAction::Continue)) => {}
            Ok(Ok(PostAction::Remove)) => self.close(),
            Ok(Err(err)) => {
                log::warn!("[mainloop] source failed while consuming events: {}", err);
                self.close();
            }
            Err(_) => {
                log::error!("[mainloop] a trigger callback panicked; closing its source");
                self.close();
            }
        }
    }

    /// Run the source's `on_close` exactly once.
    pub(crate) fn cleanup(&self) {
        if !self.cleaned.swap(true, Ordering::AcqRel) {
            self.lock().on_close();
        }
    }
}

impl Drop for SourceEntry {
    fn drop(&mut self) {
        // Covers sources whose loop terminated before they were closed.
        self.cleanup();
    }
}

/// Handle to a registered source.
///
/// Returned by every registration method of [`MainLoop`](crate::MainLoop).
/// Cloning is cheap; all clones refer to the same registration. The handle
/// is the cancellation primitive: [`close`](Source::close) stops the source
/// from dispatching immediately, and the loop releases its resources on the
/// next collection pass.
#[derive(Clone)]
pub struct Source {
    pub(crate) entry: Arc<SourceEntry>,
}

impl Source {
    /// Mark this source for removal.
    ///
    /// Idempotent and callable from any thread, including from inside the
    /// source's own trigger.
    pub fn close(&self) {
        self.entry.close();
    }

    /// Whether this source has been closed.
    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
