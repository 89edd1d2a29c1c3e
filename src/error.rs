use std::io;

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the event core and the inference adapter.
///
/// The readiness backends translate their OS error codes into the variants
/// here; callers never see raw errno values for the conditions the API
/// documents (`Already`, `TimedOut`, `Interrupted`, `WouldBlock`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operation was already performed (duplicate remove, duplicate
    /// stop, duplicate handler registration).
    #[error("operation already performed")]
    Already,

    /// A bounded wait elapsed without any descriptor becoming ready.
    #[error("wait timed out")]
    TimedOut,

    /// A signal interrupted the wait; the caller should retry.
    #[error("wait interrupted by signal")]
    Interrupted,

    /// Nothing is available right now on a non-blocking path.
    #[error("would block")]
    WouldBlock,

    /// The peer endpoint of a command channel has gone away.
    #[error("channel closed by peer")]
    ChannelClosed,

    /// The channel framing was violated; the channel is unusable.
    #[error("channel protocol violation: {0}")]
    ChannelProtocol(&'static str),

    /// Another engine in this process already owns signal handling.
    #[error("signal ownership already held")]
    SignalOwnerHeld,

    #[error("no such handler")]
    NotFound,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EALREADY => Error::Already,
            Errno::ETIMEDOUT => Error::TimedOut,
            Errno::EINTR => Error::Interrupted,
            Errno::EAGAIN => Error::WouldBlock,
            other => Error::Io(io::Error::from_raw_os_error(other as i32)),
        }
    }
}

impl Error {
    /// Snapshots `errno` after a raw libc call returned failure.
    pub(crate) fn last_os() -> Self {
        Error::from(Errno::last())
    }
}
