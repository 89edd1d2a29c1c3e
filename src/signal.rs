//! Process signal ownership and observation.
//!
//! At most one engine in the process may own signal handling. The claim is
//! an explicit RAII token rather than a hidden global flag: the engine that
//! requested signals holds the token for its lifetime and releases it on
//! drop, at which point another engine may claim it.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

static SIGNAL_OWNER: AtomicBool = AtomicBool::new(false);

/// Token proving this engine owns process-wide signal handling.
pub(crate) struct SignalOwnership(());

impl SignalOwnership {
    pub fn claim() -> Result<Self> {
        match SIGNAL_OWNER.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(Self(())),
            Err(_) => Err(Error::SignalOwnerHeld),
        }
    }
}

impl Drop for SignalOwnership {
    fn drop(&mut self) {
        SIGNAL_OWNER.store(false, Ordering::Release);
    }
}

/// Masks every signal on the calling thread and returns the previous mask.
pub(crate) fn mask_all() -> Result<nix::sys::signal::SigSet> {
    use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

    let mut old = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut old))?;
    Ok(old)
}

pub(crate) fn restore_mask(old: &nix::sys::signal::SigSet) {
    use nix::sys::signal::{pthread_sigmask, SigmaskHow};

    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(old), None) {
        log::error!("failed to restore signal mask: {e}");
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::os::fd::{AsFd, AsRawFd, RawFd};

        use nix::sys::signal::SigSet;
        use nix::sys::signalfd::{SfdFlags, SignalFd};

        /// A signalfd observing every (masked) signal, registered on the
        /// engine's multiplexer under a reserved token.
        pub(crate) struct SignalWatch {
            fd: SignalFd,
        }

        impl SignalWatch {
            pub fn install() -> Result<Self> {
                let fd = SignalFd::with_flags(
                    &SigSet::all(),
                    SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK,
                )?;
                Ok(Self { fd })
            }

            pub fn descriptor(&self) -> RawFd {
                self.fd.as_fd().as_raw_fd()
            }

            /// Consumes and logs whatever signals are pending.
            pub fn drain(&mut self) {
                loop {
                    match self.fd.read_signal() {
                        Ok(Some(info)) => {
                            log::info!("signal caught: {}", info.ssi_signo);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            log::error!("unable to read siginfo: {e}");
                            break;
                        }
                    }
                }
            }
        }
    } else {
        use std::os::fd::RawFd;

        /// macOS carries no signal descriptor; the worker thread only masks
        /// signals. Observation through kqueue's EVFILT_SIGNAL is not wired
        /// up.
        pub(crate) struct SignalWatch;

        impl SignalWatch {
            pub fn install() -> Result<Self> {
                Ok(Self)
            }

            pub fn descriptor(&self) -> RawFd {
                -1
            }

            pub fn drain(&mut self) {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_is_exclusive_until_released() {
        let first = SignalOwnership::claim().unwrap();
        assert!(matches!(SignalOwnership::claim(), Err(Error::SignalOwnerHeld)));
        drop(first);
        let second = SignalOwnership::claim().unwrap();
        drop(second);
    }
}
