//! Thin wrapper around the OS readiness multiplexer.
//!
//! The loop rebuilds its descriptor sets on every iteration, so the natural
//! primitive is a single `poll(2)` call rather than a persistent
//! registration-based poller. This module converts between the crate's
//! `Watch`/`Readiness` types and `nix::poll`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};

/// The direction a descriptor is watched for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Wait for the descriptor to become readable
    Read,
    /// Wait for the descriptor to become writable
    Write,
}

/// A descriptor interest reported by a source.
///
/// A watch always carries both the descriptor and the direction; a source
/// that has nothing to watch reports no `Watch` at all.
#[derive(Copy, Clone, Debug)]
pub struct Watch {
    /// The watched descriptor
    pub fd: RawFd,
    /// The watched direction
    pub direction: Direction,
}

/// Readiness reported for a watched descriptor.
#[derive(Copy, Clone, Debug, Default)]
pub struct Readiness {
    /// Is the descriptor readable
    pub readable: bool,
    /// Is the descriptor writable
    pub writable: bool,
    /// Is the descriptor in an error or hang-up state
    pub error: bool,
}

/// Block in `poll(2)` until a watched descriptor fires or the timeout
/// elapses.
///
/// Returns the indices (into `watches`) of the descriptors that fired,
/// along with the readiness observed for each. `None` means wait without
/// bound. Interruption by a signal is surfaced as `ErrorKind::Interrupted`
/// for the caller to retry with an adjusted timeout.
pub(crate) fn wait(
    watches: &[Watch],
    timeout: Option<Duration>,
) -> io::Result<Vec<(usize, Readiness)>> {
    let mut fds: Vec<PollFd> = watches
        .iter()
        .map(|w| {
            let events = match w.direction {
                Direction::Read => PollFlags::POLLIN,
                Direction::Write => PollFlags::POLLOUT,
            };
            PollFd::new(w.fd, events)
        })
        .collect();

    poll(&mut fds, timeout_ms(timeout))?;

    let fired = fds
        .iter()
        .enumerate()
        .filter_map(|(idx, pfd)| {
            let revents = pfd.revents().unwrap_or_else(PollFlags::empty);
            if revents.is_empty() {
                return None;
            }
            Some((
                idx,
                Readiness {
                    readable: revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
                    writable: revents.contains(PollFlags::POLLOUT),
                    error: revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
                },
            ))
        })
        .collect();

    Ok(fired)
}

// poll(2) takes milliseconds; round partial milliseconds up so a short
// timeout never degenerates into a busy spin.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(target_os = "macos")]
pub(crate) fn make_pipe() -> io::Result<(RawFd, RawFd)> {
    // macOS does not have pipe2; set the flags after the fact.
    use nix::fcntl::FdFlag;
    use nix::unistd::pipe;

    let (read, write) = pipe()?;
    fcntl(read, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(write, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    set_nonblocking(read)?;
    Ok((read, write))
}

/// Create a pipe pair, both ends close-on-exec, the read end non-blocking.
///
/// The write end is left blocking: it only ever carries short control
/// messages, and a full pipe there means the loop has stopped draining.
#[cfg(not(target_os = "macos"))]
pub(crate) fn make_pipe() -> io::Result<(RawFd, RawFd)> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    set_nonblocking(read)?;
    Ok((read, write))
}

/// Put a descriptor into non-blocking mode, preserving its other flags.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn partial_milliseconds_round_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(200))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(5))), 5);
    }

    #[test]
    fn wait_reports_readable_pipe() {
        let (read, write) = make_pipe().unwrap();
        nix::unistd::write(write, b"x").unwrap();

        let watches = [Watch {
            fd: read,
            direction: Direction::Read,
        }];
        let fired = wait(&watches, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 0);
        assert!(fired[0].1.readable);

        nix::unistd::close(read).unwrap();
        nix::unistd::close(write).unwrap();
    }

    #[test]
    fn wait_times_out() {
        let (read, write) = make_pipe().unwrap();

        let watches = [Watch {
            fd: read,
            direction: Direction::Read,
        }];
        let start = Instant::now();
        let fired = wait(&watches, Some(Duration::from_millis(50))).unwrap();
        assert!(fired.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));

        nix::unistd::close(read).unwrap();
        nix::unistd::close(write).unwrap();
    }
}
