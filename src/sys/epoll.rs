use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;
use std::{io, ptr};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollFlags};

use crate::error::{Error, Result};
use crate::event::{ReadyEvent, Readiness};
use crate::interest::{self, Interest};
use crate::sys::Multiplexer;

/// Linux readiness backend.
pub struct EpollMultiplexer {
    epoll: Epoll,
    // Reused across waits; only the loop thread ever waits, so the lock is
    // uncontended.
    events: Mutex<Vec<libc::epoll_event>>,
}

fn epoll_flags(requested: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if requested.is_read() {
        flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI;
    }
    if requested.is_write() {
        flags |= EpollFlags::EPOLLOUT;
    }
    if requested.is_error() {
        flags |= EpollFlags::EPOLLERR;
    }
    flags
}

fn readiness(events: u32) -> Readiness {
    let events = EpollFlags::from_bits_retain(events as i32);
    let mut bits = 0;
    if events.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
        bits |= interest::READ;
    }
    if events.contains(EpollFlags::EPOLLOUT) {
        bits |= interest::WRITE;
    }
    // A peer hang-up surfaces as error readiness so channel handlers can
    // cancel themselves when the other endpoint goes away.
    if events.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
        bits |= interest::ERROR;
    }
    Readiness::from_bits(bits)
}

fn epoll_ctl(epfd: &Epoll, op: i32, fd: RawFd, event: Option<libc::epoll_event>) -> Result<()> {
    let mut event = event;
    let event_ptr = match &mut event {
        Some(ev) => ev as *mut libc::epoll_event,
        None => ptr::null_mut(),
    };
    let ret = unsafe { libc::epoll_ctl(epfd.0.as_raw_fd(), op, fd, event_ptr) };
    if ret == -1 {
        return Err(Error::last_os());
    }
    Ok(())
}

impl EpollMultiplexer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?,
            events: Mutex::new(Vec::new()),
        })
    }
}

impl Multiplexer for EpollMultiplexer {
    fn add(&self, fd: RawFd, token: u64, requested: Interest) -> Result<()> {
        let flags = epoll_flags(requested);
        if flags.is_empty() {
            return Err(Error::InvalidArgument("empty interest"));
        }
        let event = libc::epoll_event {
            events: flags.bits() as u32,
            u64: token,
        };
        epoll_ctl(&self.epoll, libc::EPOLL_CTL_ADD, fd, Some(event))
    }

    fn add_timer(&self, _ident: RawFd, _interval: Duration, _token: u64) -> Result<()> {
        // Timers are real timerfd descriptors on Linux; they register
        // through `add`.
        Err(Error::InvalidArgument("timer pseudo-descriptors are kqueue-only"))
    }

    fn remove(&self, fd: RawFd) -> Result<()> {
        match epoll_ctl(&self.epoll, libc::EPOLL_CTL_DEL, fd, None) {
            Err(Error::Io(e)) if e.raw_os_error() == Some(libc::ENOENT) => Err(Error::Already),
            other => other,
        }
    }

    fn remove_timer(&self, _ident: RawFd) -> Result<()> {
        Err(Error::InvalidArgument("timer pseudo-descriptors are kqueue-only"))
    }

    fn wait(&self, buf: &mut Vec<ReadyEvent>, capacity: usize, timeout_ms: i32) -> Result<usize> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("wait capacity must be positive"));
        }
        buf.clear();

        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() < capacity {
            events.resize(capacity, libc::epoll_event { events: 0, u64: 0 });
        }
        let ret = unsafe {
            libc::epoll_wait(
                self.epoll.0.as_raw_fd(),
                events.as_mut_ptr(),
                capacity as i32,
                timeout_ms,
            )
        };
        if ret < 0 {
            return Err(Error::last_os());
        }
        if ret == 0 {
            return Err(Error::TimedOut);
        }

        for ev in &events[..ret as usize] {
            let ready = readiness(ev.events);
            if ready.is_empty() {
                continue;
            }
            buf.push(ReadyEvent {
                token: ev.u64,
                readiness: ready,
            });
        }
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;

    use super::*;
    use crate::interest::interest;

    #[test]
    fn pipe_write_reports_read_readiness() {
        let mux = EpollMultiplexer::new().unwrap();
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        mux.add(rx.as_raw_fd(), 7, interest().read()).unwrap();

        nix::unistd::write(&tx, b"x").unwrap();

        let mut buf = Vec::new();
        let n = mux.wait(&mut buf, 4, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0].token, 7);
        assert!(buf[0].readiness.is_readable());
    }

    #[test]
    fn wait_reuses_its_buffer_across_growing_capacities() {
        let mux = EpollMultiplexer::new().unwrap();
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        mux.add(rx.as_raw_fd(), 9, interest().read()).unwrap();
        nix::unistd::write(&tx, b"x").unwrap();

        let mut buf = Vec::new();
        assert_eq!(mux.wait(&mut buf, 2, 1000).unwrap(), 1);
        assert_eq!(mux.wait(&mut buf, 64, 1000).unwrap(), 1);
        assert_eq!(buf[0].token, 9);
        assert!(buf[0].readiness.is_readable());
    }

    #[test]
    fn remove_twice_reports_already() {
        let mux = EpollMultiplexer::new().unwrap();
        let (rx, _tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        mux.add(rx.as_raw_fd(), 1, interest().read()).unwrap();

        mux.remove(rx.as_raw_fd()).unwrap();
        assert!(matches!(mux.remove(rx.as_raw_fd()), Err(Error::Already)));
    }

    #[test]
    fn wait_times_out() {
        let mux = EpollMultiplexer::new().unwrap();
        let (rx, _tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        mux.add(rx.as_raw_fd(), 1, interest().read()).unwrap();

        let mut buf = Vec::new();
        assert!(matches!(mux.wait(&mut buf, 4, 10), Err(Error::TimedOut)));
    }
}
