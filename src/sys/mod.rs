//! Platform readiness backends.
//!
//! One `Multiplexer` trait, two compile-time implementations: epoll on
//! Linux, kqueue on macOS. The handler lifecycle and dispatch logic in
//! [`engine`](crate::engine) is shared and never touches OS flags.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::event::ReadyEvent;
use crate::interest::Interest;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod epoll;
        pub use epoll::EpollMultiplexer as Poller;
    } else if #[cfg(target_os = "macos")] {
        pub mod kqueue;
        pub use kqueue::KqueueMultiplexer as Poller;
    }
}

/// A readiness multiplexer wrapping one OS primitive.
///
/// `wait` blocks until at least one registered descriptor is ready,
/// the timeout elapses ([`Error::TimedOut`](crate::Error::TimedOut)) or a
/// signal interrupts the call ([`Error::Interrupted`](crate::Error::Interrupted),
/// which the caller must treat as "retry"). Removing a descriptor that is
/// not registered reports [`Error::Already`](crate::Error::Already) rather
/// than undefined behavior.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait Multiplexer: Send + Sync {
    fn add(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()>;

    /// Registers a timer pseudo-descriptor. Only meaningful on kqueue
    /// backends; timerfd-backed timers on Linux go through `add`.
    fn add_timer(&self, ident: RawFd, interval: Duration, token: u64) -> Result<()>;

    fn remove(&self, fd: RawFd) -> Result<()>;

    fn remove_timer(&self, ident: RawFd) -> Result<()>;

    /// Fills `buf` (cleared first) with up to `capacity` ready events and
    /// returns the count.
    fn wait(&self, buf: &mut Vec<ReadyEvent>, capacity: usize, timeout_ms: i32) -> Result<usize>;
}
