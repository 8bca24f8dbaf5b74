//! A generic event source wrapping an externally owned file descriptor
//!
//! You can use this general purpose adapter to watch your own descriptors
//! for read or write readiness. The event payload is the raw
//! [`Readiness`]; protocol logic (draining, buffered writes) lives in the
//! trigger. The loop's [`add_read`](crate::MainLoop::add_read) and
//! [`add_write`](crate::MainLoop::add_write) helpers build exactly that on
//! top of this source.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::unistd::close;

use crate::sys::{Direction, Readiness, Watch};
use crate::{EventSource, PostAction};

/// An event source wrapping an externally supplied descriptor.
#[derive(Debug)]
pub struct IoSource {
    fd: Option<RawFd>,
    direction: Direction,
    auto_close: bool,
    readiness: Option<Readiness>,
}

impl IoSource {
    /// Watch `fd` for readiness in `direction`.
    ///
    /// The descriptor stays owned by the caller; see
    /// [`auto_close`](IoSource::auto_close) to transfer ownership.
    pub fn new(fd: RawFd, direction: Direction) -> IoSource {
        IoSource {
            fd: Some(fd),
            direction,
            auto_close: false,
            readiness: None,
        }
    }

    /// Make the source close the descriptor when it is itself closed.
    pub fn auto_close(mut self, auto_close: bool) -> IoSource {
        self.auto_close = auto_close;
        self
    }

    fn release(&mut self) {
        if let Some(fd) = self.fd.take() {
            if self.auto_close {
                if let Err(err) = close(fd) {
                    log::warn!("[mainloop] failed to close watched fd {}: {:?}", fd, err);
                }
            }
        }
    }
}

impl EventSource for IoSource {
    type Event = Readiness;

    fn poll_ready(&mut self, _: Instant) -> bool {
        self.readiness.is_some()
    }

    fn timeout(&self, _: Instant) -> Option<Duration> {
        None
    }

    fn watch(&self) -> Option<Watch> {
        self.fd.map(|fd| Watch {
            fd,
            direction: self.direction,
        })
    }

    fn mark_fd_ready(&mut self, readiness: Readiness) {
        self.readiness = Some(readiness);
    }

    fn consume<F>(&mut self, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event) -> PostAction,
    {
        debug_assert!(self.readiness.is_some(), "io source dispatched while idle");
        match self.readiness.take() {
            Some(readiness) => Ok(callback(readiness)),
            None => Ok(PostAction::Continue),
        }
    }

    fn on_close(&mut self) {
        self.release();
    }
}

impl Drop for IoSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// What [`add_read`](crate::MainLoop::add_read) delivers to its callback.
#[derive(Debug)]
pub enum ReadEvent {
    /// A chunk read from the descriptor.
    Data(Vec<u8>),

    /// End of file; the source closes after delivering this.
    Eof,

    /// A read failed; the source closes after delivering this.
    Error(io::Error),
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::IoSource;
    use crate::sys::Direction;
    use crate::{MainLoop, PostAction};

    #[test]
    fn readiness_only_when_readable() {
        use std::io::Write;

        let event_loop = MainLoop::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();

        let dispatched = Arc::new(AtomicBool::new(false));
        let dispatched2 = dispatched.clone();
        event_loop
            .add_source(
                IoSource::new(rx.as_raw_fd(), Direction::Read),
                move |readiness| {
                    assert!(readiness.readable);
                    dispatched2.store(true, Ordering::SeqCst);
                    PostAction::Remove
                },
            )
            .unwrap();

        // Nothing written yet: a zero-bound step must not dispatch. The
        // idle source keeps the multiplexer from blocking.
        let gate = event_loop.add_idle(|| PostAction::Continue).unwrap();
        event_loop.step().unwrap();
        assert!(!dispatched.load(Ordering::SeqCst));
        gate.close();

        tx.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
        tx.flush().unwrap();

        event_loop.step().unwrap();
        assert!(dispatched.load(Ordering::SeqCst));
    }

    #[test]
    fn write_direction_fires_on_writable_socket() {
        let event_loop = MainLoop::new().unwrap();
        let (tx, _rx) = UnixStream::pair().unwrap();

        let dispatched = Arc::new(AtomicBool::new(false));
        let dispatched2 = dispatched.clone();
        event_loop
            .add_source(
                IoSource::new(tx.as_raw_fd(), Direction::Write),
                move |readiness| {
                    assert!(readiness.writable);
                    dispatched2.store(true, Ordering::SeqCst);
                    PostAction::Remove
                },
            )
            .unwrap();

        event_loop.step().unwrap();
        assert!(dispatched.load(Ordering::SeqCst));
    }
}
