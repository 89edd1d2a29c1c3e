//! Pipe-backed `(id, pointer)` channel with ownership transfer.
//!
//! A `CommandChannel` endpoint writes fixed-size frames carrying a command
//! id and the address of a boxed payload. Ownership of the payload moves to
//! the receiving endpoint on a successful read; the channel never inspects
//! the pointee. Frames are delivered in write order.

use std::marker::PhantomData;
use std::mem::size_of;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::pipe2;

use crate::error::{Error, Result};
use crate::source::EventSource;

const FRAME_LEN: usize = size_of::<i64>() + size_of::<u64>();

fn encode(id: i32, addr: usize) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..8].copy_from_slice(&i64::from(id).to_ne_bytes());
    frame[8..].copy_from_slice(&(addr as u64).to_ne_bytes());
    frame
}

fn decode(frame: &[u8; FRAME_LEN]) -> (i32, usize) {
    let id = i64::from_ne_bytes(frame[..8].try_into().unwrap());
    let addr = u64::from_ne_bytes(frame[8..].try_into().unwrap());
    (id as i32, addr as usize)
}

fn write_bytes(fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let ret = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            errno => return Err(Error::from(errno)),
        }
    }
}

fn read_bytes(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            errno => return Err(Error::from(errno)),
        }
    }
}

/// One endpoint of a command channel carrying boxed `T` payloads.
pub struct CommandChannel<T> {
    fd: OwnedFd,
    _payload: PhantomData<Box<T>>,
}

/// A connected duplex pair (socketpair-backed); both endpoints can send
/// and receive. Used for command/response RPC.
pub fn duplex<T>() -> Result<(CommandChannel<T>, CommandChannel<T>)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    Ok((CommandChannel::from_fd(a), CommandChannel::from_fd(b)))
}

/// A one-way queue pair (pipe-backed), returned as `(consumer, producer)`.
/// Used for output queueing, where results must never block behind RPC
/// traffic.
pub fn queue<T>() -> Result<(CommandChannel<T>, CommandChannel<T>)> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC)?;
    Ok((CommandChannel::from_fd(rx), CommandChannel::from_fd(tx)))
}

impl<T> CommandChannel<T> {
    fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            _payload: PhantomData,
        }
    }

    /// Sends `(id, payload)`. Ownership of the payload transfers to the
    /// peer; it is reclaimed only if nothing was written.
    pub fn send(&self, id: i32, payload: Box<T>) -> Result<()> {
        let addr = Box::into_raw(payload) as usize;
        let frame = encode(id, addr);

        let written = match write_bytes(self.fd.as_raw_fd(), &frame) {
            Ok(n) => n,
            Err(e) => {
                // Nothing on the wire; the payload is still ours.
                drop(unsafe { Box::from_raw(addr as *mut T) });
                return Err(e);
            }
        };
        if written == FRAME_LEN {
            return Ok(());
        }

        // A short write is retried once; failing again poisons the channel
        // and the in-flight payload is unreachable from either side.
        log::debug!("short command frame write ({written} bytes), retrying");
        match write_bytes(self.fd.as_raw_fd(), &frame[written..]) {
            Ok(n) if written + n == FRAME_LEN => Ok(()),
            _ => {
                log::error!("command channel corrupted by short write");
                Err(Error::ChannelProtocol("short frame write"))
            }
        }
    }

    /// Blocking receive of the next `(id, payload)` frame. The caller
    /// assumes ownership of the payload.
    pub fn recv(&self) -> Result<(i32, Box<T>)> {
        let mut frame = [0u8; FRAME_LEN];

        let got = read_bytes(self.fd.as_raw_fd(), &mut frame)?;
        if got == 0 {
            return Err(Error::ChannelClosed);
        }
        if got < FRAME_LEN {
            log::debug!("short command frame read ({got} bytes), retrying");
            let more = read_bytes(self.fd.as_raw_fd(), &mut frame[got..])?;
            if got + more != FRAME_LEN {
                log::error!("command channel corrupted by short read");
                return Err(Error::ChannelProtocol("short frame read"));
            }
        }

        let (id, addr) = decode(&frame);
        if addr == 0 {
            return Err(Error::ChannelProtocol("null payload address"));
        }
        let payload = unsafe { Box::from_raw(addr as *mut T) };
        Ok((id, payload))
    }
}

impl<T> Drop for CommandChannel<T> {
    /// Frames still queued toward this endpoint hold the only reference to
    /// their payloads; reclaim them before the descriptor closes.
    fn drop(&mut self) {
        let flags = match fcntl(&self.fd, FcntlArg::F_GETFL) {
            Ok(flags) => OFlag::from_bits_truncate(flags),
            Err(_) => return,
        };
        if fcntl(&self.fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).is_err() {
            return;
        }
        let mut frame = [0u8; FRAME_LEN];
        while let Ok(FRAME_LEN) = read_bytes(self.fd.as_raw_fd(), &mut frame) {
            let (_, addr) = decode(&frame);
            if addr != 0 {
                drop(unsafe { Box::from_raw(addr as *mut T) });
            }
        }
    }
}

impl<T> EventSource for CommandChannel<T> {
    fn descriptor(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_recv_round_trips_the_exact_pair() {
        let (a, b) = duplex::<String>().unwrap();
        a.send(7, Box::new("tensor".to_owned())).unwrap();

        let (id, payload) = b.recv().unwrap();
        assert_eq!(id, 7);
        assert_eq!(*payload, "tensor");
    }

    #[test]
    fn messages_arrive_in_fifo_order() {
        let (consumer, producer) = queue::<u32>().unwrap();
        producer.send(1, Box::new(100)).unwrap();
        producer.send(2, Box::new(200)).unwrap();

        assert_eq!(consumer.recv().map(|(id, p)| (id, *p)).unwrap(), (1, 100));
        assert_eq!(consumer.recv().map(|(id, p)| (id, *p)).unwrap(), (2, 200));
    }

    #[test]
    fn recv_after_peer_close_reports_channel_closed() {
        let (consumer, producer) = queue::<u32>().unwrap();
        drop(producer);
        assert!(matches!(consumer.recv(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn duplex_is_bidirectional() {
        let (a, b) = duplex::<u8>().unwrap();
        a.send(1, Box::new(1)).unwrap();
        b.send(2, Box::new(2)).unwrap();

        assert_eq!(b.recv().map(|(id, p)| (id, *p)).unwrap(), (1, 1));
        assert_eq!(a.recv().map(|(id, p)| (id, *p)).unwrap(), (2, 2));
    }

    #[test]
    fn dropping_an_endpoint_reclaims_queued_payloads() {
        use std::sync::Arc;

        let marker = Arc::new(());
        let (consumer, producer) = queue::<Arc<()>>().unwrap();
        producer.send(1, Box::new(Arc::clone(&marker))).unwrap();
        producer.send(2, Box::new(Arc::clone(&marker))).unwrap();

        drop(producer);
        drop(consumer);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn payload_crosses_threads_intact() {
        let (consumer, producer) = queue::<Vec<u8>>().unwrap();
        let sender = std::thread::spawn(move || {
            producer.send(9, Box::new(vec![1, 2, 3])).unwrap();
        });

        let (id, payload) = consumer.recv().unwrap();
        assert_eq!(id, 9);
        assert_eq!(*payload, vec![1, 2, 3]);
        sender.join().unwrap();
    }
}
