use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{ReadyEvent, Readiness};
use crate::interest::{self, Interest};
use crate::sys::Multiplexer;

/// macOS readiness backend.
///
/// kqueue has no single interest mask per descriptor; READ and WRITE are
/// separate filters, registered and removed individually. Timers use
/// `EVFILT_TIMER` keyed by a pseudo-ident since macOS has no timerfd.
pub struct KqueueMultiplexer {
    queue: OwnedFd,
    // Reused across waits; only the loop thread ever waits, so the lock is
    // uncontended.
    events: Mutex<Vec<libc::kevent>>,
}

fn apply(kq: RawFd, changes: &[libc::kevent]) -> Result<()> {
    let ret = unsafe {
        libc::kevent(
            kq,
            changes.as_ptr(),
            changes.len() as i32,
            ptr::null_mut(),
            0,
            ptr::null(),
        )
    };
    if ret < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

fn change(ident: RawFd, filter: i16, flags: u16, data: isize, token: u64) -> libc::kevent {
    libc::kevent {
        ident: ident as usize,
        filter,
        flags,
        fflags: 0,
        data,
        udata: token as *mut libc::c_void,
    }
}

impl KqueueMultiplexer {
    pub fn new() -> Result<Self> {
        let raw = unsafe { libc::kqueue() };
        if raw < 0 {
            return Err(Error::last_os());
        }
        Ok(Self {
            queue: unsafe { OwnedFd::from_raw_fd(raw) },
            events: Mutex::new(Vec::new()),
        })
    }

    fn raw(&self) -> RawFd {
        self.queue.as_raw_fd()
    }
}

impl Multiplexer for KqueueMultiplexer {
    fn add(&self, fd: RawFd, token: u64, requested: Interest) -> Result<()> {
        if requested.is_empty() {
            return Err(Error::InvalidArgument("empty interest"));
        }
        let mut changes = Vec::with_capacity(2);
        if requested.is_read() {
            changes.push(change(
                fd,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_ENABLE,
                0,
                token,
            ));
        }
        if requested.is_write() {
            changes.push(change(
                fd,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_ENABLE,
                0,
                token,
            ));
        }
        if changes.is_empty() {
            // ERROR-only interest; kqueue reports errors on whichever
            // filter is armed, so arm the read filter.
            changes.push(change(
                fd,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_ENABLE,
                0,
                token,
            ));
        }
        apply(self.raw(), &changes)
    }

    fn add_timer(&self, ident: RawFd, interval: Duration, token: u64) -> Result<()> {
        let ev = change(
            ident,
            libc::EVFILT_TIMER,
            libc::EV_ADD | libc::EV_ENABLE,
            interval.as_millis() as isize,
            token,
        );
        apply(self.raw(), &[ev])
    }

    fn remove(&self, fd: RawFd) -> Result<()> {
        let mut removed = false;
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            let ev = change(fd, filter, libc::EV_DELETE | libc::EV_DISABLE, 0, 0);
            match apply(self.raw(), &[ev]) {
                Ok(()) => removed = true,
                // The filter may simply not have been armed for this fd.
                Err(Error::Io(e)) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => return Err(e),
            }
        }
        if removed {
            Ok(())
        } else {
            Err(Error::Already)
        }
    }

    fn remove_timer(&self, ident: RawFd) -> Result<()> {
        let ev = change(ident, libc::EVFILT_TIMER, libc::EV_DELETE | libc::EV_DISABLE, 0, 0);
        match apply(self.raw(), &[ev]) {
            Err(Error::Io(e)) if e.raw_os_error() == Some(libc::ENOENT) => Err(Error::Already),
            other => other,
        }
    }

    fn wait(&self, buf: &mut Vec<ReadyEvent>, capacity: usize, timeout_ms: i32) -> Result<usize> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("wait capacity must be positive"));
        }
        buf.clear();

        let timeout = if timeout_ms < 0 {
            None
        } else {
            Some(libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            })
        };
        let timeout_ptr = timeout
            .as_ref()
            .map_or(ptr::null(), |ts| ts as *const libc::timespec);

        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() < capacity {
            events.resize(capacity, change(0, 0, 0, 0, 0));
        }
        let ret = unsafe {
            libc::kevent(
                self.raw(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                capacity as i32,
                timeout_ptr,
            )
        };
        if ret < 0 {
            return Err(Error::last_os());
        }
        if ret == 0 {
            return Err(Error::TimedOut);
        }

        for ev in &events[..ret as usize] {
            let mut bits = 0;
            match ev.filter {
                libc::EVFILT_READ | libc::EVFILT_TIMER => bits |= interest::READ,
                libc::EVFILT_WRITE => bits |= interest::WRITE,
                _ => {}
            }
            if ev.flags & libc::EV_ERROR != 0 || ev.flags & libc::EV_EOF != 0 {
                bits |= interest::ERROR;
            }
            let ready = Readiness::from_bits(bits);
            if ready.is_empty() {
                continue;
            }
            buf.push(ReadyEvent {
                token: ev.udata as u64,
                readiness: ready,
            });
        }
        Ok(buf.len())
    }
}
