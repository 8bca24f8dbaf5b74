//! The main loop: registration, the readiness/wait/dispatch cycle, and
//! lifecycle.

use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::unistd;

use crate::reaper::ChildRecord;
use crate::source::{EventSource, PostAction, Source, SourceEntry};
use crate::sources::fiber::FiberSource;
use crate::sources::idle::IdleSource;
use crate::sources::io::{IoSource, ReadEvent};
use crate::sources::pipe::{PipeSource, PipeWriter};
use crate::sources::signals::{Signal, SignalSource};
use crate::sources::timer::TimeoutSource;
use crate::sys::{self, Direction};

/// Buffer used by the `add_read` drain loop.
const READ_CHUNK: usize = 4096;

/// A main event loop.
///
/// Sources are registered with the `add_*` methods; [`run`](MainLoop::run)
/// then cycles through collection, a single multiplexer wait bounded by the
/// earliest timer, and dispatch, until [`quit`](MainLoop::quit) is
/// requested.
///
/// `MainLoop` is cheaply cloneable and all clones refer to the same loop,
/// so handles can be moved into trigger callbacks and to other threads.
/// Exactly one thread may execute `run` (or `step`) at a time; every
/// trigger callback executes serially on that thread. Any thread may
/// register sources or request quit, and a loop parked in the multiplexer
/// is woken through its internal control pipe within one system call.
#[derive(Clone)]
pub struct MainLoop {
    pub(crate) inner: Arc<LoopInner>,
}

pub(crate) struct LoopInner {
    state: Mutex<LoopState>,

    /// Write end of the control pipe, carrying the one-byte messages `'.'`
    /// (wakeup) and `'q'` (quit).
    control: PipeWriter,

    /// The registration of the control pipe's read end.
    control_entry: Arc<SourceEntry>,

    /// Set by the control source when it sees a `'q'` byte; observed at
    /// the end of every step. Shared with the control callback.
    quit: Arc<AtomicBool>,
}

pub(crate) struct LoopState {
    /// Registered sources, in registration order.
    sources: Vec<Arc<SourceEntry>>,

    /// Callbacks to run, in registration order, after the loop stops and
    /// before the sources are torn down.
    quit_handlers: Vec<Box<dyn FnOnce() + Send>>,

    /// Children spawned through the loop and not yet reaped.
    pub(crate) children: Vec<ChildRecord>,

    /// The lazily installed SIGCHLD source, plus a writer to its pipe used
    /// to force a sweep from regular context.
    pub(crate) reaper: Option<Source>,
    pub(crate) reaper_nudge: Option<PipeWriter>,

    /// The thread currently inside `run`.
    runner: Option<ThreadId>,

    /// Terminal state: set when `run` returns. No further registration is
    /// accepted.
    terminated: bool,
}

impl LoopState {
    pub(crate) fn terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) fn push_source(&mut self, entry: Arc<SourceEntry>) {
        self.sources.push(entry);
    }
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MainLoop { ... }")
    }
}

impl MainLoop {
    /// Create a new main loop.
    ///
    /// Fails if the control pipe cannot be created.
    pub fn new() -> crate::Result<MainLoop> {
        let (writer, control_pipe) = PipeSource::new()?;
        let quit = Arc::new(AtomicBool::new(false));

        let quit2 = quit.clone();
        let control_entry = SourceEntry::new(control_pipe, move |bytes: Vec<u8>| {
            for byte in bytes {
                match byte {
                    b'.' => {}
                    b'q' => quit2.store(true, Ordering::Release),
                    other => panic!("illegal control byte: 0x{:02x}", other),
                }
            }
            PostAction::Continue
        });

        let state = LoopState {
            sources: vec![control_entry.clone()],
            quit_handlers: Vec::new(),
            children: Vec::new(),
            reaper: None,
            reaper_nudge: None,
            runner: None,
            terminated: false,
        };

        Ok(MainLoop {
            inner: Arc::new(LoopInner {
                state: Mutex::new(state),
                control: writer,
                control_entry,
                quit,
            }),
        })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, LoopState> {
        // No user code runs while this lock is held (dispatch happens with
        // it released), so poisoning cannot indicate corrupted state.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A writer to the control pipe, for internal wakeup plumbing.
    pub(crate) fn control_writer(&self) -> PipeWriter {
        self.inner.control.clone()
    }

    /// Insert a new event source with its trigger callback.
    ///
    /// The callback is invoked on the loop thread whenever the source is
    /// ready; returning [`PostAction::Remove`] closes the source, any other
    /// return keeps it alive. When called from a thread other than the
    /// current runner, the parked multiplexer is woken so the new source is
    /// observed on the next iteration.
    ///
    /// Fails with [`Error::Terminated`](crate::Error::Terminated) once the
    /// loop has finished running.
    pub fn add_source<S, F>(&self, source: S, callback: F) -> crate::Result<Source>
    where
        S: EventSource + 'static,
        F: FnMut(S::Event) -> PostAction + Send + 'static,
    {
        self.register(SourceEntry::new(source, callback))
    }

    fn register(&self, entry: Arc<SourceEntry>) -> crate::Result<Source> {
        let wake = {
            let mut state = self.state();
            if state.terminated {
                return Err(crate::Error::Terminated);
            }
            state.sources.push(entry.clone());
            state
                .runner
                .map_or(false, |runner| runner != thread::current().id())
        };
        if wake {
            self.send_wakeup();
        }
        Ok(Source { entry })
    }

    /// Run a callback on every loop iteration until it returns
    /// [`PostAction::Remove`].
    pub fn add_idle<F>(&self, mut callback: F) -> crate::Result<Source>
    where
        F: FnMut() -> PostAction + Send + 'static,
    {
        self.add_source(IdleSource::new(), move |()| callback())
    }

    /// Run a callback once, after an optional delay.
    ///
    /// `None` (or a zero delay) fires on the next iteration.
    pub fn add_once<D, F>(&self, delay: D, callback: F) -> crate::Result<Source>
    where
        D: Into<Option<Duration>>,
        F: FnOnce() + Send + 'static,
    {
        let delay = delay.into().unwrap_or(Duration::ZERO);
        let mut callback = Some(callback);
        self.add_source(TimeoutSource::once(delay), move |_| {
            if let Some(callback) = callback.take() {
                callback();
            }
            PostAction::Remove
        })
    }

    /// Run a callback every `interval` until it returns
    /// [`PostAction::Remove`].
    ///
    /// The callback receives the deadline of the tick being delivered.
    pub fn add_timeout<F>(&self, interval: Duration, callback: F) -> crate::Result<Source>
    where
        F: FnMut(Instant) -> PostAction + Send + 'static,
    {
        self.add_source(TimeoutSource::new(interval), callback)
    }

    /// Intercept Unix signals and deliver them to `callback` on the loop
    /// thread.
    ///
    /// All signals collected between two loop iterations arrive in a
    /// single call.
    pub fn add_unix_signal<F>(&self, signals: &[Signal], callback: F) -> crate::Result<Source>
    where
        F: FnMut(Vec<Signal>) -> PostAction + Send + 'static,
    {
        self.add_source(SignalSource::new(signals)?, callback)
    }

    /// Watch `fd` for readability and drain it to `callback`.
    ///
    /// The descriptor is switched to non-blocking mode. Each readiness
    /// drains it in a tight loop: every chunk is delivered as
    /// [`ReadEvent::Data`]; end of file and read errors are delivered as
    /// their own events and close the source.
    pub fn add_read<F>(&self, fd: RawFd, mut callback: F) -> crate::Result<Source>
    where
        F: FnMut(ReadEvent) -> PostAction + Send + 'static,
    {
        sys::set_nonblocking(fd)?;
        self.add_source(IoSource::new(fd, Direction::Read), move |_| {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match unistd::read(fd, &mut buf) {
                    Ok(0) => {
                        callback(ReadEvent::Eof);
                        return PostAction::Remove;
                    }
                    Ok(count) => {
                        if callback(ReadEvent::Data(buf[..count].to_vec())) == PostAction::Remove {
                            return PostAction::Remove;
                        }
                    }
                    Err(Errno::EAGAIN) => return PostAction::Continue,
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        callback(ReadEvent::Error(err.into()));
                        return PostAction::Remove;
                    }
                }
            }
        })
    }

    /// Write `buf` to `fd` as it becomes writable, then run `callback`.
    ///
    /// The descriptor is switched to non-blocking mode. Accounting is in
    /// bytes; the callback fires exactly once, with `Ok(())` after the
    /// whole buffer has been written or with the error that stopped the
    /// write. Either way the source then closes.
    pub fn add_write<F>(&self, fd: RawFd, buf: Vec<u8>, callback: F) -> crate::Result<Source>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        sys::set_nonblocking(fd)?;
        let mut callback = Some(callback);
        let mut offset = 0;
        self.add_source(IoSource::new(fd, Direction::Write), move |_| {
            while offset < buf.len() {
                match unistd::write(fd, &buf[offset..]) {
                    Ok(count) => offset += count,
                    Err(Errno::EAGAIN) => return PostAction::Continue,
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        if let Some(callback) = callback.take() {
                            callback(Err(err.into()));
                        }
                        return PostAction::Remove;
                    }
                }
            }
            if let Some(callback) = callback.take() {
                callback(Ok(()));
            }
            PostAction::Remove
        })
    }

    /// Register a fiber: a future polled by the loop, one step per
    /// iteration in which it has been woken.
    ///
    /// See the [`fiber`](crate::sources::fiber) module for the yield
    /// protocol.
    pub fn add_fiber<Fut>(&self, body: Fut) -> crate::Result<Source>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_source(FiberSource::new(self, body), |()| PostAction::Remove)
    }

    /// Register a callback to run during loop shutdown, after the last
    /// step and before the sources are closed.
    ///
    /// Handlers run exactly once, in registration order.
    pub fn add_quit<F>(&self, callback: F) -> crate::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state();
        if state.terminated {
            return Err(crate::Error::Terminated);
        }
        state.quit_handlers.push(Box::new(callback));
        Ok(())
    }

    /// Ask the loop to stop after the current step finishes.
    ///
    /// Idempotent, and callable from any thread as well as from inside
    /// trigger callbacks (both go through the control pipe). Not
    /// async-signal-safe: signal handlers must go through a signal source
    /// instead.
    pub fn quit(&self) {
        if let Err(err) = self.inner.control.write(b"q") {
            log::warn!("[mainloop] failed to post quit byte: {}", err);
        }
    }

    /// Wake the loop without any other effect.
    ///
    /// If the loop is parked in the multiplexer this makes the current
    /// step finish early.
    pub fn send_wakeup(&self) {
        if let Err(err) = self.inner.control.write(b".") {
            log::warn!("[mainloop] failed to post wakeup byte: {}", err);
        }
    }

    /// Whether some thread is currently inside [`run`](MainLoop::run).
    pub fn is_running(&self) -> bool {
        self.state().runner.is_some()
    }

    /// Perform one readiness-collection, wait and dispatch cycle.
    pub fn step(&self) -> crate::Result<()> {
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut watches = Vec::new();
        let mut watchers: Vec<Arc<SourceEntry>> = Vec::new();
        let mut min_timeout: Option<Duration> = None;

        {
            let mut state = self.state();
            if state.terminated {
                return Err(crate::Error::Terminated);
            }

            // Drop closed sources, releasing what they own.
            state.sources.retain(|entry| {
                if entry.is_closed() {
                    entry.cleanup();
                    false
                } else {
                    true
                }
            });

            for entry in &state.sources {
                if entry.poll_ready(now) {
                    ready.push(entry.clone());
                } else if let Some(watch) = entry.watch() {
                    watches.push(watch);
                    watchers.push(entry.clone());
                }
                if let Some(timeout) = entry.timeout(now) {
                    min_timeout = Some(min_timeout.map_or(timeout, |m| m.min(timeout)));
                }
            }
        }

        // A source that is already ready must be dispatched now; do not
        // block, only collect whatever the descriptors have as well.
        let timeout = if ready.is_empty() {
            min_timeout
        } else {
            Some(Duration::ZERO)
        };

        // The wait happens with the registry unlocked so that other
        // threads can register sources (and wake us) meanwhile.
        let events = {
            let start = Instant::now();
            let mut timeout = timeout;
            loop {
                match sys::wait(&watches, timeout) {
                    Ok(events) => break events,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        // Interrupted by a signal; retry with what remains.
                        if let Some(bound) = timeout {
                            let elapsed = start.elapsed();
                            if elapsed >= bound {
                                break Vec::new();
                            }
                            timeout = Some(bound - elapsed);
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        for (index, readiness) in events {
            let entry = &watchers[index];
            entry.mark_fd_ready(readiness);
            if !ready.iter().any(|other| Arc::ptr_eq(other, entry)) {
                ready.push(entry.clone());
            }
        }

        // Dispatch outside the registry lock: triggers may take arbitrary
        // time and may re-enter the registration API.
        for entry in ready {
            if entry.is_closed() {
                continue;
            }
            entry.dispatch();
        }

        // The loop cannot be woken once its control channel is gone.
        if self.inner.control_entry.is_closed() {
            self.inner.quit.store(true, Ordering::Release);
        }

        Ok(())
    }

    /// Run the loop until [`quit`](MainLoop::quit) is requested.
    ///
    /// On the way out the quit handlers run in registration order, tracked
    /// children are detached, every remaining source is closed, and the
    /// loop enters its terminal state: further registration fails and
    /// `run` cannot be called again.
    pub fn run(&self) -> crate::Result<()> {
        {
            let mut state = self.state();
            if state.terminated {
                return Err(crate::Error::Terminated);
            }
            if state.runner.is_some() {
                return Err(crate::Error::AlreadyRunning);
            }
            state.runner = Some(thread::current().id());
        }

        let result = loop {
            if let Err(err) = self.step() {
                break Err(err);
            }
            if self.inner.quit.load(Ordering::Acquire) {
                break Ok(());
            }
        };

        self.shutdown();
        result
    }

    fn shutdown(&self) {
        let (handlers, sources, children) = {
            let mut state = self.state();
            state.terminated = true;
            state.reaper = None;
            state.reaper_nudge = None;
            (
                std::mem::take(&mut state.quit_handlers),
                std::mem::take(&mut state.sources),
                std::mem::take(&mut state.children),
            )
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(handler)).is_err() {
                log::error!("[mainloop] a quit handler panicked");
            }
        }

        for entry in &sources {
            entry.close();
            entry.cleanup();
        }

        // Detach: whoever reaps these children now is not us.
        drop(children);

        self.state().runner = None;
    }
}
