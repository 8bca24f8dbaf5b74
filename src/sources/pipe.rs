//! A pipe-backed event source
//!
//! [`PipeSource::new`] creates an OS pipe and splits it into a
//! [`PipeSource`], to be inserted into a loop, and a cloneable
//! [`PipeWriter`] for the sending side. The source becomes ready whenever
//! the kernel has buffered bytes and delivers them as chunk events.
//!
//! This is the building block for waking a loop from another part of the
//! program: the loop's own control channel is a pipe source, and the signal
//! source marshals traps through one.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::unistd::{close, read, write};

use crate::sys::{self, Direction, Readiness, Watch};
use crate::{EventSource, PostAction};

/// Upper bound on the bytes consumed from the pipe per dispatch.
const CHUNK_SIZE: usize = 4096;

/// The reading half of a pipe, usable as an event source.
///
/// Generates one `Vec<u8>` event per dispatch, holding up to 4 KiB read
/// from the pipe. When the write end is closed and the pipe is drained the
/// source silently removes itself.
#[derive(Debug)]
pub struct PipeSource {
    /// Read end; `None` once released.
    fd: Option<RawFd>,

    /// Kernel-reported readability, recorded between the multiplexer
    /// returning and the dispatch that consumes it.
    fd_ready: bool,
}

/// The writing half of a pipe created by [`PipeSource::new`].
///
/// Cheaply cloneable and sendable across threads; the descriptor is closed
/// when the last clone is dropped. Writes block if the pipe fills up, so
/// this is meant for short control messages only.
#[derive(Clone, Debug)]
pub struct PipeWriter {
    fd: Arc<WriteEnd>,
}

#[derive(Debug)]
struct WriteEnd(RawFd);

impl Drop for WriteEnd {
    fn drop(&mut self) {
        if let Err(err) = close(self.0) {
            log::warn!("[mainloop] failed to close pipe write end: {:?}", err);
        }
    }
}

impl PipeSource {
    /// Create a pipe pair.
    ///
    /// The read end is non-blocking and close-on-exec; the write end is
    /// blocking and close-on-exec.
    pub fn new() -> io::Result<(PipeWriter, PipeSource)> {
        let (read, write) = sys::make_pipe()?;
        Ok((
            PipeWriter {
                fd: Arc::new(WriteEnd(write)),
            },
            PipeSource {
                fd: Some(read),
                fd_ready: false,
            },
        ))
    }

    fn release(&mut self) {
        if let Some(fd) = self.fd.take() {
            if let Err(err) = close(fd) {
                log::warn!("[mainloop] failed to close pipe read end: {:?}", err);
            }
        }
    }
}

impl EventSource for PipeSource {
    type Event = Vec<u8>;

    fn poll_ready(&mut self, _: Instant) -> bool {
        self.fd_ready
    }

    fn timeout(&self, _: Instant) -> Option<Duration> {
        None
    }

    fn watch(&self) -> Option<Watch> {
        self.fd.map(|fd| Watch {
            fd,
            direction: Direction::Read,
        })
    }

    fn mark_fd_ready(&mut self, readiness: Readiness) {
        if readiness.readable || readiness.error {
            self.fd_ready = true;
        }
    }

    fn consume<F>(&mut self, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event) -> PostAction,
    {
        self.fd_ready = false;
        let fd = match self.fd {
            Some(fd) => fd,
            None => return Ok(PostAction::Remove),
        };

        // A single bounded read per dispatch; level triggering brings us
        // back if more is buffered.
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match read(fd, &mut buf) {
                // Write end closed and the pipe is drained.
                Ok(0) => return Ok(PostAction::Remove),
                Ok(count) => return Ok(callback(buf[..count].to_vec())),
                Err(Errno::EAGAIN) => return Ok(PostAction::Continue),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn on_close(&mut self) {
        self.release();
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        self.release();
    }
}

impl PipeWriter {
    /// Write the whole buffer to the pipe.
    ///
    /// Blocks if the pipe is full. Short writes and signal interruptions
    /// are retried until every byte is enqueued.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            match write(self.fd.0, &buf[written..]) {
                Ok(count) => written += count,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl AsRawFd for PipeWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.0
    }
}
