//! Child process supervision
//!
//! [`MainLoop::spawn`] starts a child and arranges for its exit status to
//! be delivered to a callback on the loop thread. The machinery is a
//! lazily installed signal source for `SIGCHLD`: every delivery sweeps the
//! children the loop has spawned with a non-blocking wait and fires the
//! completion callbacks of those that terminated.
//!
//! The sweep only ever waits on PIDs this loop spawned itself; children
//! managed elsewhere in the process are never touched. At loop termination
//! any still-running child is detached and left to its own devices.

use std::process::{Child, Command, ExitStatus};

use crate::source::{PostAction, Source, SourceEntry};
use crate::sources::signals::{self, Signal, SignalSource};
use crate::MainLoop;

/// A child tracked by the loop until it is reaped.
pub(crate) struct ChildRecord {
    pid: u32,
    child: Child,
    on_exit: Option<Box<dyn FnOnce(ChildStatus) + Send>>,
}

/// The exit status of a reaped child.
///
/// Thin wrapper over [`std::process::ExitStatus`] presenting the POSIX
/// wait-status predicates.
#[derive(Debug, Clone, Copy)]
pub struct ChildStatus(ExitStatus);

impl ChildStatus {
    /// Did the child exit with a zero status code?
    pub fn success(&self) -> bool {
        self.0.success()
    }

    /// Did the child terminate by calling `exit`?
    pub fn exited(&self) -> bool {
        self.0.code().is_some()
    }

    /// The exit code, when [`exited`](ChildStatus::exited).
    pub fn code(&self) -> Option<i32> {
        self.0.code()
    }

    /// Was the child terminated by a signal?
    pub fn signaled(&self) -> bool {
        self.signal().is_some()
    }

    /// The terminating signal number, when
    /// [`signaled`](ChildStatus::signaled).
    pub fn signal(&self) -> Option<i32> {
        std::os::unix::process::ExitStatusExt::signal(&self.0)
    }

    /// Was the child stopped by a signal?
    pub fn stopped(&self) -> bool {
        std::os::unix::process::ExitStatusExt::stopped_signal(&self.0).is_some()
    }

    /// Did the terminating signal produce a core dump?
    pub fn core_dumped(&self) -> bool {
        std::os::unix::process::ExitStatusExt::core_dumped(&self.0)
    }
}

impl MainLoop {
    /// Spawn a child process and deliver its exit status to `on_exit`.
    ///
    /// The callback runs on the loop thread once the child has been
    /// reaped. Returns the child's PID. Fails with
    /// [`Error::Spawn`](crate::Error::Spawn) if the process could not be
    /// started.
    pub fn spawn<F>(&self, command: Command, on_exit: F) -> crate::Result<u32>
    where
        F: FnOnce(ChildStatus) + Send + 'static,
    {
        self.spawn_inner(command, Some(Box::new(on_exit)))
    }

    /// Spawn a child process that is reaped silently.
    pub fn spawn_quiet(&self, command: Command) -> crate::Result<u32> {
        self.spawn_inner(command, None)
    }

    fn spawn_inner(
        &self,
        mut command: Command,
        on_exit: Option<Box<dyn FnOnce(ChildStatus) + Send>>,
    ) -> crate::Result<u32> {
        self.ensure_reaper()?;

        let child = command.spawn().map_err(crate::Error::Spawn)?;
        let pid = child.id();

        let nudge = {
            let mut state = self.state();
            state.children.push(ChildRecord {
                pid,
                child,
                on_exit,
            });
            state.reaper_nudge.clone()
        };

        // The child may already have exited, with its SIGCHLD consumed by
        // an earlier sweep that did not know it yet. Posting the token from
        // here forces a sweep that does.
        if let Some(nudge) = nudge {
            let _ = nudge.write(signals::token(Signal::SIGCHLD));
        }

        // A parked loop is not watching a freshly installed reaper pipe.
        self.send_wakeup();

        Ok(pid)
    }

    /// Install the SIGCHLD source if this loop does not have one yet.
    ///
    /// The whole install happens under the registry lock: a concurrent
    /// second installer would otherwise tear down the first one's trap
    /// while rolling back.
    fn ensure_reaper(&self) -> crate::Result<()> {
        let mut state = self.state();
        if state.terminated() {
            return Err(crate::Error::Terminated);
        }
        if state.reaper.is_some() {
            return Ok(());
        }

        let source = SignalSource::new(&[Signal::SIGCHLD])?;
        let nudge = source.writer();
        // A weak handle avoids a reference cycle through the registry.
        let weak = std::sync::Arc::downgrade(&self.inner);
        let entry = SourceEntry::new(source, move |_signals: Vec<Signal>| match weak.upgrade() {
            Some(inner) => {
                MainLoop { inner }.reap();
                PostAction::Continue
            }
            None => PostAction::Remove,
        });

        state.push_source(entry.clone());
        state.reaper = Some(Source { entry });
        state.reaper_nudge = Some(nudge);
        Ok(())
    }

    /// Sweep tracked children with a non-blocking wait, firing completion
    /// callbacks for those that terminated.
    fn reap(&self) {
        let mut finished = Vec::new();
        {
            let mut state = self.state();
            let mut remaining = Vec::with_capacity(state.children.len());
            for mut record in state.children.drain(..) {
                match record.child.try_wait() {
                    Ok(Some(status)) => finished.push((record.on_exit, ChildStatus(status))),
                    Ok(None) => remaining.push(record),
                    Err(err) => {
                        log::warn!(
                            "[mainloop] failed to wait on child {}: {}",
                            record.pid,
                            err
                        );
                    }
                }
            }
            state.children = remaining;
        }

        // Callbacks run with the registry unlocked, on the loop thread.
        for (on_exit, status) in finished {
            if let Some(on_exit) = on_exit {
                on_exit(status);
            }
        }
    }
}
