//! Cooperative fibers driven by the loop
//!
//! A fiber is a future registered with
//! [`add_fiber`](crate::MainLoop::add_fiber). The loop polls it once per
//! iteration in which it has been woken, so a fiber interleaves with every
//! other source instead of monopolizing the thread. Two awaitables define
//! its yield protocol:
//!
//! - [`pause()`] suspends the fiber until the next loop iteration;
//! - [`perform()`] hands a one-shot [`Task`] handle to a closure and
//!   suspends until some other party, typically a background thread,
//!   calls [`Task::done`] with the awaited value.
//!
//! Waking a fiber from another thread pokes the loop's control pipe, so a
//! parked loop resumes it within one system call.
//!
//! ```no_run
//! use mainloop::{MainLoop, fiber};
//!
//! let event_loop = MainLoop::new().unwrap();
//! event_loop
//!     .add_fiber(async move {
//!         fiber::pause().await;
//!         let value = fiber::perform(|task| {
//!             std::thread::spawn(move || task.done(6 * 7));
//!         })
//!         .await;
//!         assert_eq!(value, 42);
//!     })
//!     .unwrap();
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use crate::sources::pipe::PipeWriter;
use crate::{EventSource, MainLoop, PostAction};

/// An event source driving one fiber.
///
/// Generates a single `()` event when the fiber completes, then removes
/// itself. Usually constructed through
/// [`add_fiber`](crate::MainLoop::add_fiber).
pub struct FiberSource {
    future: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    shared: Arc<FiberWaker>,
}

struct FiberWaker {
    /// Set by the waker, cleared when the loop polls the fiber.
    awake: AtomicBool,

    /// The loop's control pipe, poked on cross-thread wakeups.
    control: PipeWriter,
}

impl FiberWaker {
    fn rouse(&self) {
        if !self.awake.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.control.write(b".") {
                log::warn!("[mainloop] failed to wake the loop for a fiber: {}", err);
            }
        }
    }
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.rouse();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.rouse();
    }
}

impl FiberSource {
    /// Wrap a future into a fiber bound to `event_loop`.
    ///
    /// The fiber starts on the loop's next iteration.
    pub fn new(
        event_loop: &MainLoop,
        body: impl Future<Output = ()> + Send + 'static,
    ) -> FiberSource {
        FiberSource {
            future: Some(Box::pin(body)),
            shared: Arc::new(FiberWaker {
                // Born awake so the first iteration starts the fiber.
                awake: AtomicBool::new(true),
                control: event_loop.control_writer(),
            }),
        }
    }
}

impl EventSource for FiberSource {
    type Event = ();

    fn poll_ready(&mut self, _: Instant) -> bool {
        self.shared.awake.load(Ordering::Acquire)
    }

    fn timeout(&self, _: Instant) -> Option<Duration> {
        if self.shared.awake.load(Ordering::Acquire) {
            Some(Duration::ZERO)
        } else {
            None
        }
    }

    fn consume<F>(&mut self, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event) -> PostAction,
    {
        // Clear before polling: a wake arriving during the poll must not
        // be lost.
        self.shared.awake.store(false, Ordering::Release);

        let future = match self.future.as_mut() {
            Some(future) => future,
            None => return Ok(PostAction::Remove),
        };

        let waker = Waker::from(self.shared.clone());
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.future = None;
                let _ = callback(());
                Ok(PostAction::Remove)
            }
            Poll::Pending => Ok(PostAction::Continue),
        }
    }
}

/// Suspend the calling fiber until the next loop iteration.
///
/// Lets every other ready source run before the fiber continues.
pub fn pause() -> Pause {
    Pause { yielded: false }
}

/// Future returned by [`pause()`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Pause {
    yielded: bool,
}

impl Future for Pause {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Suspend the calling fiber until a [`Task`] is completed.
///
/// `arrange` receives the fresh task handle in the loop's dispatch context
/// and is responsible for arranging, possibly from another thread, that
/// [`Task::done`] is eventually called. The await resolves to the value the
/// task was completed with.
pub fn perform<T, F>(arrange: F) -> Perform<T, F>
where
    F: FnOnce(Task<T>),
{
    Perform {
        arrange: Some(arrange),
        state: Arc::new(TaskState {
            value: Mutex::new(None),
            waker: Mutex::new(None),
        }),
    }
}

/// Future returned by [`perform()`].
#[must_use = "futures do nothing unless awaited"]
pub struct Perform<T, F> {
    arrange: Option<F>,
    state: Arc<TaskState<T>>,
}

struct TaskState<T> {
    value: Mutex<Option<T>>,
    waker: Mutex<Option<Waker>>,
}

/// A one-shot handle resuming a waiting fiber with a value.
///
/// Obtained through [`perform()`]. Completing the task consumes it, which
/// makes a double completion unrepresentable.
pub struct Task<T> {
    state: Arc<TaskState<T>>,
}

impl<T> Task<T> {
    /// Complete the task, resuming the awaiting fiber with `value`.
    ///
    /// Callable from any thread; if the loop is parked in the multiplexer
    /// it is woken immediately.
    pub fn done(self, value: T) {
        *self.state.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        let waker = self
            .state
            .waker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task { .. }")
    }
}

impl<T, F> Future for Perform<T, F>
where
    F: FnOnce(Task<T>) + Unpin,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();

        if let Some(value) = this
            .state
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            return Poll::Ready(value);
        }

        // Park the waker before running the closure so a completion racing
        // with this poll still finds someone to wake.
        *this
            .state
            .waker
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(cx.waker().clone());

        if let Some(arrange) = this.arrange.take() {
            arrange(Task {
                state: this.state.clone(),
            });
            // The closure may have completed the task synchronously.
            if let Some(value) = this
                .state
                .value
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                return Poll::Ready(value);
            }
        }

        Poll::Pending
    }
}
