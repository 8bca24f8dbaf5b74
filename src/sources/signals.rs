//! An event source for Unix signals
//!
//! A [`SignalSource`] marshals signal delivery back onto the loop through a
//! self-pipe: construction installs a trap for every requested signal, and
//! the trap does nothing but write a pre-allocated token (`<signo>\n`) to
//! the pipe with a single non-blocking `write(2)`. No allocation and no
//! locking happens in trap context. The loop then reads the pipe like any
//! other source and delivers every signal collected since the previous
//! iteration as one `Vec<Signal>` event, on the loop thread.
//!
//! Closing the source restores the dispositions that were in place before
//! it was created.
//!
//! Traps are process-wide: two loops intercepting the same signal number
//! will clobber each other, which this crate does not attempt to fix.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

pub use nix::sys::signal::Signal;

use crate::sources::pipe::{PipeSource, PipeWriter};
use crate::sys::{self, Readiness, Watch};
use crate::{EventSource, PostAction};

/// Token delimiter on the signal pipe.
const DELIMITER: u8 = b'\n';

/// One slot per interceptable signal number.
const MAX_SIGNAL: usize = 32;

/// Write end of the pipe owning each signal number, or -1.
///
/// The trap handler reads this table and nothing else.
static TRAP_FDS: [AtomicI32; MAX_SIGNAL] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const VACANT: AtomicI32 = AtomicI32::new(-1);
    [VACANT; MAX_SIGNAL]
};

/// Pre-built trap messages, `<decimal signo><delimiter>`, indexed by signal
/// number. Built at compile time so the trap never formats or allocates.
static TOKENS: [&[u8]; MAX_SIGNAL] = [
    b"0\n", b"1\n", b"2\n", b"3\n", b"4\n", b"5\n", b"6\n", b"7\n", b"8\n", b"9\n", b"10\n",
    b"11\n", b"12\n", b"13\n", b"14\n", b"15\n", b"16\n", b"17\n", b"18\n", b"19\n", b"20\n",
    b"21\n", b"22\n", b"23\n", b"24\n", b"25\n", b"26\n", b"27\n", b"28\n", b"29\n", b"30\n",
    b"31\n",
];

// Async-signal-safe by construction: one table load, one write(2) of a
// static buffer. A full pipe drops the token, which is acceptable; the
// reader is about to sweep anyway.
extern "C" fn trap_handler(signo: libc::c_int) {
    let idx = signo as usize;
    if idx >= MAX_SIGNAL {
        return;
    }
    let fd = TRAP_FDS[idx].load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let token = TOKENS[idx];
    unsafe {
        libc::write(fd, token.as_ptr().cast(), token.len());
    }
}

/// An event source producing the Unix signals it intercepts.
pub struct SignalSource {
    pipe: PipeSource,
    writer: PipeWriter,
    previous: Vec<(Signal, SigAction)>,
    carry: Vec<u8>,
}

impl std::fmt::Debug for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSource")
            .field(
                "signals",
                &self.previous.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl SignalSource {
    /// Intercept the given signals.
    ///
    /// Installs a trap for each; the previously installed dispositions are
    /// saved and reinstated when the source is closed.
    pub fn new(signals: &[Signal]) -> crate::Result<SignalSource> {
        let (writer, pipe) = PipeSource::new()?;
        // The trap must never block on a full pipe.
        sys::set_nonblocking(writer.as_raw_fd())?;

        let action = SigAction::new(
            SigHandler::Handler(trap_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        let mut previous = Vec::with_capacity(signals.len());
        for &signal in signals {
            TRAP_FDS[signal as i32 as usize].store(writer.as_raw_fd(), Ordering::SeqCst);
            match unsafe { sigaction(signal, &action) } {
                Ok(old) => previous.push((signal, old)),
                Err(err) => {
                    TRAP_FDS[signal as i32 as usize].store(-1, Ordering::SeqCst);
                    restore(&mut previous);
                    return Err(err.into());
                }
            }
        }

        Ok(SignalSource {
            pipe,
            writer,
            previous,
            carry: Vec::new(),
        })
    }

    /// A handle to the signal pipe, for posting a token from regular
    /// (non-trap) context to force a sweep.
    pub(crate) fn writer(&self) -> PipeWriter {
        self.writer.clone()
    }
}

/// The trap message for `signal`, as written to the pipe.
pub(crate) fn token(signal: Signal) -> &'static [u8] {
    TOKENS[signal as i32 as usize]
}

fn restore(previous: &mut Vec<(Signal, SigAction)>) {
    for (signal, old) in previous.drain(..) {
        TRAP_FDS[signal as i32 as usize].store(-1, Ordering::SeqCst);
        if let Err(err) = unsafe { sigaction(signal, &old) } {
            log::warn!("[mainloop] failed to restore trap for {}: {:?}", signal, err);
        }
    }
}

/// Split the accumulated pipe bytes into signals, carrying any incomplete
/// trailing token over to the next read.
fn parse_tokens(carry: &mut Vec<u8>, chunk: &[u8]) -> Vec<Signal> {
    carry.extend_from_slice(chunk);
    let mut signals = Vec::new();
    while let Some(pos) = carry.iter().position(|&b| b == DELIMITER) {
        let token: Vec<u8> = carry.drain(..=pos).collect();
        let parsed = std::str::from_utf8(&token[..token.len() - 1])
            .ok()
            .and_then(|text| text.parse::<i32>().ok())
            .and_then(|signo| Signal::try_from(signo).ok());
        match parsed {
            Some(signal) => signals.push(signal),
            None => log::warn!("[mainloop] discarding malformed signal token {:?}", token),
        }
    }
    signals
}

impl EventSource for SignalSource {
    type Event = Vec<Signal>;

    fn poll_ready(&mut self, now: Instant) -> bool {
        self.pipe.poll_ready(now)
    }

    fn timeout(&self, now: Instant) -> Option<Duration> {
        self.pipe.timeout(now)
    }

    fn watch(&self) -> Option<Watch> {
        self.pipe.watch()
    }

    fn mark_fd_ready(&mut self, readiness: Readiness) {
        self.pipe.mark_fd_ready(readiness);
    }

    fn consume<F>(&mut self, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event) -> PostAction,
    {
        let Self {
            ref mut pipe,
            ref mut carry,
            ..
        } = *self;
        pipe.consume(|chunk| {
            let signals = parse_tokens(carry, &chunk);
            if signals.is_empty() {
                PostAction::Continue
            } else {
                callback(signals)
            }
        })
    }

    fn on_close(&mut self) {
        restore(&mut self.previous);
        self.pipe.on_close();
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        restore(&mut self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_tokens, token, Signal};

    #[test]
    fn tokens_split_on_delimiter() {
        let mut input = Vec::new();
        input.extend_from_slice(token(Signal::SIGUSR1));
        input.extend_from_slice(token(Signal::SIGUSR2));

        let mut carry = Vec::new();
        let signals = parse_tokens(&mut carry, &input);
        assert_eq!(signals, vec![Signal::SIGUSR1, Signal::SIGUSR2]);
        assert!(carry.is_empty());
    }

    #[test]
    fn partial_token_carries_over() {
        let tok = token(Signal::SIGUSR1);

        let mut carry = Vec::new();
        assert!(parse_tokens(&mut carry, &tok[..tok.len() - 1]).is_empty());
        assert!(!carry.is_empty());

        let signals = parse_tokens(&mut carry, &tok[tok.len() - 1..]);
        assert_eq!(signals, vec![Signal::SIGUSR1]);
        assert!(carry.is_empty());
    }

    #[test]
    fn malformed_tokens_are_dropped() {
        let mut carry = Vec::new();
        let signals = parse_tokens(&mut carry, b"zz\n99\n2\n");
        assert_eq!(signals, vec![Signal::SIGINT]);
    }

    #[test]
    fn trap_messages_match_signal_numbers() {
        assert_eq!(token(Signal::SIGCHLD), format!("{}\n", Signal::SIGCHLD as i32).as_bytes());
        assert_eq!(token(Signal::SIGUSR1), format!("{}\n", Signal::SIGUSR1 as i32).as_bytes());
    }
}
