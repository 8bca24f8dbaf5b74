//! Mainloop, a callback-based event loop for POSIX processes
//!
//! This crate provides a [`MainLoop`] type modeled on the classic GLib
//! main loop: you register *sources* (timers, idle slots, pipes, file
//! descriptors, Unix signals, child processes, cooperative fibers), each
//! associated with a trigger callback, and the loop dispatches every
//! source that becomes ready. Between iterations it parks in a single
//! `poll(2)` wait bounded by the earliest timer, so an idle loop costs
//! nothing.
//!
//! The design goals are robustness and ease of composition rather than
//! raw throughput: everything dispatches serially on one thread, other
//! threads interact with the loop only through its registration API, and
//! signal delivery is marshaled onto the loop thread through a self-pipe.
//!
//! ## How to use it
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mainloop::{MainLoop, PostAction};
//!
//! fn main() {
//!     let event_loop = MainLoop::new().expect("failed to initialize the event loop");
//!
//!     event_loop
//!         .add_timeout(Duration::from_secs(1), |_| {
//!             println!("tick");
//!             PostAction::Continue
//!         })
//!         .unwrap();
//!
//!     let quitter = event_loop.clone();
//!     event_loop
//!         .add_unix_signal(&[mainloop::Signal::SIGINT], move |_| {
//!             quitter.quit();
//!             PostAction::Remove
//!         })
//!         .unwrap();
//!
//!     event_loop.run().unwrap();
//! }
//! ```
//!
//! ## Event source types
//!
//! The provided sources live under [`sources`]; the common registration
//! shortcuts are methods on [`MainLoop`] (`add_idle`, `add_once`,
//! `add_timeout`, `add_read`, `add_write`, `add_unix_signal`,
//! `add_fiber`, `spawn`). Anything implementing [`EventSource`] can be
//! inserted with [`MainLoop::add_source`].
//!
//! Every trigger callback decides the fate of its own source through the
//! returned [`PostAction`]: `Remove` unregisters it, `Continue` keeps it
//! alive.

#![warn(missing_docs)]
#![cfg(unix)]

pub use self::error::{Error, Result};
pub use self::loop_logic::MainLoop;
pub use self::reaper::ChildStatus;
pub use self::source::{EventSource, PostAction, Source};
pub use self::sources::fiber;
pub use self::sources::fiber::{FiberSource, Task};
pub use self::sources::idle::IdleSource;
pub use self::sources::io::{IoSource, ReadEvent};
pub use self::sources::pipe::{PipeSource, PipeWriter};
pub use self::sources::signals::{Signal, SignalSource};
pub use self::sources::timer::TimeoutSource;
pub use self::sys::{Direction, Readiness, Watch};

mod error;
mod loop_logic;
mod reaper;
mod source;
pub mod sources;
mod sys;
