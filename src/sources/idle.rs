//! An always-ready event source
//!
//! An [`IdleSource`] is ready on every loop iteration and fires its trigger
//! once per iteration until it is closed. While one is registered the loop
//! never blocks in the multiplexer: the source reports a zero timeout,
//! which degenerates the wait into a non-blocking poll.

use std::io;
use std::time::{Duration, Instant};

use crate::{EventSource, PostAction};

/// An event source that is ready on every loop iteration.
#[derive(Debug, Default)]
pub struct IdleSource {
    _private: (),
}

impl IdleSource {
    /// Create a new idle source.
    pub fn new() -> IdleSource {
        IdleSource::default()
    }
}

impl EventSource for IdleSource {
    type Event = ();

    fn poll_ready(&mut self, _: Instant) -> bool {
        true
    }

    fn timeout(&self, _: Instant) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    fn consume<F>(&mut self, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event) -> PostAction,
    {
        Ok(callback(()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::{MainLoop, PostAction};

    #[test]
    fn idle_fires_every_step() {
        let event_loop = MainLoop::new().unwrap();

        let counters: Vec<Arc<AtomicUsize>> =
            (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        for counter in &counters {
            let counter = counter.clone();
            event_loop
                .add_idle(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    PostAction::Continue
                })
                .unwrap();
        }

        for _ in 0..5 {
            event_loop.step().unwrap();
        }

        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 5);
        }
    }

    #[test]
    fn idle_removed_on_request() {
        let event_loop = MainLoop::new().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        event_loop
            .add_idle(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
                PostAction::Remove
            })
            .unwrap();

        for _ in 0..3 {
            event_loop.step().unwrap();
        }

        // removed after its first dispatch, never invoked again
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
