//! Timer-based event sources
//!
//! A [`TimeoutSource`] generates an event whenever its deadline passes. A
//! repeating source re-arms itself after every fire by advancing the
//! deadline in whole intervals from the *previous* deadline, so ticks keep
//! their phase; if the loop stalls for longer than several intervals the
//! source fires once and re-arms to the next future tick rather than
//! replaying the missed ones.
//!
//! The event payload is the `Instant` of the tick that fired, which lets a
//! trigger distinguish a late delivery from an on-time one.

use std::io;
use std::time::{Duration, Instant};

use crate::{EventSource, PostAction};

/// A time-based event source.
#[derive(Debug)]
pub struct TimeoutSource {
    /// `None` for a one-shot source.
    repeat: Option<Duration>,

    /// `None` once a one-shot source has fired; the source is then inert.
    deadline: Option<Instant>,

    /// Latched tick: `Some` between the readiness poll that observed the
    /// deadline and the consumption of the event.
    fired: Option<Instant>,
}

impl TimeoutSource {
    /// Create a repeating source firing every `interval`.
    ///
    /// The first fire happens one full interval from now.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero: a zero-interval timer would spin the
    /// loop. Use an [`IdleSource`](crate::IdleSource) for work on every
    /// iteration.
    pub fn new(interval: Duration) -> TimeoutSource {
        assert!(
            !interval.is_zero(),
            "timeout interval must be non-zero; use an idle source instead"
        );
        TimeoutSource {
            repeat: Some(interval),
            deadline: Some(Instant::now() + interval),
            fired: None,
        }
    }

    /// Create a one-shot source firing once after `delay`.
    ///
    /// A zero delay fires on the next loop iteration. After the fire the
    /// source stays registered but inert; triggers that do not want to be
    /// polled again should return [`PostAction::Remove`].
    pub fn once(delay: Duration) -> TimeoutSource {
        TimeoutSource {
            repeat: None,
            deadline: Some(Instant::now() + delay),
            fired: None,
        }
    }

    fn advance(&mut self, now: Instant) {
        let previous = match self.deadline {
            Some(deadline) => deadline,
            None => return,
        };
        self.deadline = self.repeat.map(|interval| {
            let mut next = previous + interval;
            while next <= now {
                next += interval;
            }
            next
        });
    }
}

impl EventSource for TimeoutSource {
    type Event = Instant;

    fn poll_ready(&mut self, now: Instant) -> bool {
        if self.fired.is_some() {
            return true;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.fired = Some(deadline);
                self.advance(now);
                true
            }
            _ => false,
        }
    }

    fn timeout(&self, now: Instant) -> Option<Duration> {
        if self.fired.is_some() {
            return Some(Duration::ZERO);
        }
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn consume<F>(&mut self, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event) -> PostAction,
    {
        debug_assert!(self.fired.is_some(), "timeout dispatched while armed");
        match self.fired.take() {
            Some(tick) => Ok(callback(tick)),
            None => Ok(PostAction::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::TimeoutSource;
    use crate::{EventSource, MainLoop, PostAction};

    #[test]
    fn repeating_fires_at_least_four_times_in_window() {
        let event_loop = MainLoop::new().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        event_loop
            .add_timeout(Duration::from_millis(50), move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
                PostAction::Continue
            })
            .unwrap();

        let quitter = event_loop.clone();
        event_loop
            .add_once(Duration::from_millis(210), move || quitter.quit())
            .unwrap();

        event_loop.run().unwrap();

        assert!(fired.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        let event_loop = MainLoop::new().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        event_loop
            .add_timeout(Duration::from_millis(50), move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
                PostAction::Remove
            })
            .unwrap();

        let quitter = event_loop.clone();
        event_loop
            .add_once(Duration::from_millis(210), move || quitter.quit())
            .unwrap();

        event_loop.run().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn elapsed_deadline_observed_by_single_step() {
        let event_loop = MainLoop::new().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        event_loop
            .add_timeout(Duration::from_millis(100), move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
                PostAction::Continue
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        event_loop.step().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stalled_timer_does_not_replay_missed_ticks() {
        let interval = Duration::from_millis(10);
        let mut source = TimeoutSource::new(interval);

        // Simulate a stall of many intervals.
        std::thread::sleep(Duration::from_millis(55));

        let now = Instant::now();
        assert!(source.poll_ready(now));
        source.consume(|_| PostAction::Continue).unwrap();

        // Only a single fire; the next deadline is in the future.
        assert!(!source.poll_ready(now));
        let remaining = source.timeout(now).unwrap();
        assert!(remaining > Duration::ZERO && remaining <= interval);
    }

    #[test]
    fn ready_is_latched_until_consumed() {
        let mut source = TimeoutSource::once(Duration::ZERO);
        let now = Instant::now() + Duration::from_millis(1);

        assert!(source.poll_ready(now));
        // A second poll must not lose the latched tick.
        assert!(source.poll_ready(now));
        assert_eq!(source.timeout(now), Some(Duration::ZERO));

        let mut seen = 0;
        source
            .consume(|_| {
                seen += 1;
                PostAction::Continue
            })
            .unwrap();
        assert_eq!(seen, 1);

        // One-shot: inert after the fire.
        assert!(!source.poll_ready(now));
        assert_eq!(source.timeout(now), None);
    }
}
