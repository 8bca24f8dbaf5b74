/// The primary error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The loop has finished running; no further source can be registered.
    #[error("the main loop has terminated")]
    Terminated,

    /// `run()` was invoked while another thread was already running the loop.
    #[error("the main loop is already running on another thread")]
    AlreadyRunning,

    /// An underlying IO operation failed.
    #[error("underlying IO error")]
    Io(#[from] std::io::Error),

    /// A child process could not be spawned.
    #[error("failed to spawn child process")]
    Spawn(#[source] std::io::Error),
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Into::<std::io::Error>::into(err).into()
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(source) => Self::new(source.kind(), source),
            Error::Spawn(source) => Self::new(source.kind(), source),
            Error::Terminated | Error::AlreadyRunning => {
                Self::new(std::io::ErrorKind::Other, err.to_string())
            }
        }
    }
}

/// The primary result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
