use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

/// Minimal contract binding a raw descriptor to the event model.
///
/// The source does not own the descriptor's lifecycle beyond reporting its
/// handle; a negative descriptor means "not yet ready for registration".
pub trait EventSource {
    fn descriptor(&self) -> RawFd;

    /// Timer sources report their firing interval here. On kqueue systems
    /// the backend registers them as an `EVFILT_TIMER` pseudo-descriptor
    /// instead of a real file descriptor.
    fn timer_interval(&self) -> Option<Duration> {
        None
    }
}

impl EventSource for RawFd {
    fn descriptor(&self) -> RawFd {
        *self
    }
}

impl EventSource for OwnedFd {
    fn descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }
}

impl EventSource for BorrowedFd<'_> {
    fn descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::os::fd::AsFd;

        use nix::sys::time::TimeSpec;
        use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

        use crate::error::Result;

        /// A periodic timer usable as an [`EventSource`].
        ///
        /// Backed by a `timerfd`, so it registers like any other descriptor.
        pub struct TimerSource {
            timer: TimerFd,
        }

        impl TimerSource {
            pub fn new(interval: Duration) -> Result<Self> {
                let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_CLOEXEC)?;
                timer.set(
                    Expiration::Interval(TimeSpec::from_duration(interval)),
                    TimerSetTimeFlags::empty(),
                )?;
                Ok(Self { timer })
            }

            /// Acknowledges an expiration. Must be called from the handler,
            /// otherwise the descriptor stays readable.
            pub fn acknowledge(&self) -> Result<()> {
                self.timer.wait()?;
                Ok(())
            }
        }

        impl EventSource for TimerSource {
            fn descriptor(&self) -> RawFd {
                self.timer.as_fd().as_raw_fd()
            }
        }
    } else {
        use std::sync::atomic::{AtomicI32, Ordering};

        use crate::error::Result;

        // kqueue timer idents share the numeric space with nothing else in
        // the process, but keep them clear of real descriptors anyway.
        static NEXT_TIMER_IDENT: AtomicI32 = AtomicI32::new(1 << 20);

        /// A periodic timer usable as an [`EventSource`].
        ///
        /// macOS has no timerfd; the backend maps this to an
        /// `EVFILT_TIMER` registration keyed by a pseudo-ident.
        pub struct TimerSource {
            ident: RawFd,
            interval: Duration,
        }

        impl TimerSource {
            pub fn new(interval: Duration) -> Result<Self> {
                Ok(Self {
                    ident: NEXT_TIMER_IDENT.fetch_add(1, Ordering::Relaxed),
                    interval,
                })
            }

            /// kqueue consumes timer expirations on delivery; nothing to
            /// acknowledge.
            pub fn acknowledge(&self) -> Result<()> {
                Ok(())
            }
        }

        impl EventSource for TimerSource {
            fn descriptor(&self) -> RawFd {
                self.ident
            }

            fn timer_interval(&self) -> Option<Duration> {
                Some(self.interval)
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::interest::interest;
    use crate::sys::{Multiplexer, Poller};

    #[test]
    fn timer_turns_readable_after_its_interval() {
        let mux = Poller::new().unwrap();
        let timer = TimerSource::new(Duration::from_millis(20)).unwrap();
        mux.add(timer.descriptor(), 3, interest().read()).unwrap();

        let mut buf = Vec::new();
        let n = mux.wait(&mut buf, 4, 2000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0].token, 3);
        assert!(buf[0].readiness.is_readable());

        // Unacknowledged expirations keep the descriptor readable.
        timer.acknowledge().unwrap();
    }
}
