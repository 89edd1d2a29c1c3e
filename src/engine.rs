//! The event loop: handler registration, dispatch and lifecycle.
//!
//! One engine owns one multiplexer and a table of handler slots keyed by
//! registration token. The loop may run inline on the caller's thread or on
//! a dedicated worker thread; either way there is exactly one dispatching
//! thread, woken through a self-pipe when another thread requests a stop.
//!
//! Removal is safe at any time, including from inside a handler and from
//! other threads while a handler is running: a removal that loses the
//! in-use race parks the slot in a delete-pending state and the dispatcher
//! finishes the removal as soon as the callback returns.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::event::{Readiness, ReadyEvent};
use crate::handler::{
    CancelFn, Dispatch, EventFn, HandlerId, HandlerSlot, STATE_DELETED, STATE_DELETE_PENDING,
};
use crate::interest::{interest, Interest};
use crate::signal::{mask_all, restore_mask, SignalOwnership, SignalWatch};
use crate::source::EventSource;
use crate::sys::{Multiplexer, Poller};

/// Reserved token for the self-pipe that wakes the loop on stop requests.
pub(crate) const CONTROL_TOKEN: u64 = 0;
/// Reserved token for the signal descriptor, when signal handling is on.
pub(crate) const SIGNAL_TOKEN: u64 = 1;
const FIRST_USER_TOKEN: u64 = 2;

/// Default `wait` batch size for callers without an opinion.
pub const DEFAULT_WAIT_CAPACITY: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RunState {
    Stopped,
    StartRequested,
    Started,
    StopRequested,
}

type StopHook = Box<dyn FnOnce() + Send>;

struct Inner<M: Multiplexer> {
    mux: M,
    handlers: Mutex<FxHashMap<u64, Arc<HandlerSlot>>>,
    next_token: AtomicU64,
    state: Mutex<RunState>,
    control_rx: OwnedFd,
    control_tx: OwnedFd,
    stop_hook: Mutex<Option<StopHook>>,
    handle_signals: bool,
    _signals: Option<SignalOwnership>,
}

/// Readiness-driven event loop.
///
/// Generic over the multiplexer so dispatch bookkeeping is testable against
/// a mock; production code uses the platform [`Poller`] via [`EventLoop::new`].
pub struct EventLoop<M: Multiplexer + 'static = Poller> {
    inner: Arc<Inner<M>>,
    worker: Option<JoinHandle<Result<()>>>,
    use_thread: bool,
}

/// Cloneable, thread-safe handle for stopping an engine or removing a
/// handler from outside (or from inside a callback of) the loop.
///
/// Holds only a weak reference; a control outliving its engine degrades to
/// reporting [`Error::Already`] from `stop`.
#[derive(Clone)]
pub struct LoopControl {
    ops: Weak<dyn ControlOps + Send + Sync>,
}

trait ControlOps {
    fn stop(&self) -> Result<()>;
    fn remove_token(&self, token: u64) -> Result<()>;
}

impl EventLoop<Poller> {
    /// Creates an engine over the platform multiplexer.
    ///
    /// `use_thread` selects whether [`run`](Self::run) spawns a dedicated
    /// worker or blocks the caller. `handle_signals` claims process-wide
    /// signal ownership for this engine; only one engine per process may
    /// hold it, and the claim fails with [`Error::SignalOwnerHeld`] while
    /// another engine does.
    pub fn new(use_thread: bool, handle_signals: bool) -> Result<Self> {
        Self::with_multiplexer(Poller::new()?, use_thread, handle_signals)
    }
}

impl<M: Multiplexer + 'static> EventLoop<M> {
    pub fn with_multiplexer(mux: M, use_thread: bool, handle_signals: bool) -> Result<Self> {
        let signals = if handle_signals {
            Some(SignalOwnership::claim()?)
        } else {
            None
        };

        let (control_rx, control_tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        mux.add(control_rx.as_raw_fd(), CONTROL_TOKEN, interest().read())?;

        Ok(Self {
            inner: Arc::new(Inner {
                mux,
                handlers: Mutex::new(FxHashMap::default()),
                next_token: AtomicU64::new(FIRST_USER_TOKEN),
                state: Mutex::new(RunState::Stopped),
                control_rx,
                control_tx,
                stop_hook: Mutex::new(None),
                handle_signals,
                _signals: signals,
            }),
            worker: None,
            use_thread,
        })
    }

    /// Registers `source` for the given interest. The returned id is the
    /// only external handle to the registration; removing it consumes the
    /// id.
    pub fn add_handler<F>(
        &self,
        source: &dyn EventSource,
        interest: Interest,
        on_event: F,
    ) -> Result<HandlerId>
    where
        F: FnMut(RawFd, Readiness) -> Dispatch + Send + 'static,
    {
        self.inner
            .register(source, interest, Box::new(on_event), None)
    }

    /// Like [`add_handler`](Self::add_handler), with a hook the engine
    /// invokes exactly once after a handler cancels itself (after the
    /// registration is fully torn down, outside the in-use section).
    pub fn add_handler_with_cancel<F, C>(
        &self,
        source: &dyn EventSource,
        interest: Interest,
        on_event: F,
        on_cancel: C,
    ) -> Result<HandlerId>
    where
        F: FnMut(RawFd, Readiness) -> Dispatch + Send + 'static,
        C: FnOnce(RawFd) + Send + 'static,
    {
        self.inner
            .register(source, interest, Box::new(on_event), Some(Box::new(on_cancel)))
    }

    /// Removes a handler, from any thread, at any time.
    ///
    /// If the handler is mid-dispatch on the loop thread, the slot is
    /// marked delete-pending and the dispatcher completes the removal when
    /// the callback returns; the call still succeeds. Removing a handler
    /// that is already going away reports [`Error::Already`].
    pub fn remove_handler(&self, id: HandlerId) -> Result<()> {
        self.inner.remove_token(id.token)
    }

    /// Runs the loop: `loop_count` wait iterations (`-1` for unbounded),
    /// each blocking up to `timeout_ms` milliseconds (`-1` for no limit).
    /// A timed-out wait ends the run cleanly.
    ///
    /// With `use_thread` the call returns immediately and the loop runs on
    /// a worker; otherwise it blocks until the loop ends.
    pub fn run(&mut self, capacity: usize, loop_count: i64, timeout_ms: i32) -> Result<()> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("wait capacity must be positive"));
        }
        if loop_count == 0 || loop_count < -1 {
            return Err(Error::InvalidArgument("loop count must be positive or -1"));
        }
        if timeout_ms < -1 {
            return Err(Error::InvalidArgument("timeout must be non-negative or -1"));
        }

        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != RunState::Stopped {
                return Err(Error::Already);
            }
            *state = RunState::StartRequested;
        }

        // A previous threaded run may have ended on its own; reap it.
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.join().unwrap_or(Ok(())) {
                log::warn!("previous loop run ended with error: {e}");
            }
        }

        if self.use_thread {
            let inner = Arc::clone(&self.inner);
            let handle = match thread::Builder::new()
                .name("event-loop".into())
                .spawn(move || inner.run_loop(capacity, loop_count, timeout_ms))
            {
                Ok(handle) => handle,
                Err(e) => {
                    // Roll back so the engine stays startable.
                    let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                    *state = RunState::Stopped;
                    return Err(Error::Io(e));
                }
            };
            self.worker = Some(handle);
            Ok(())
        } else {
            self.inner.run_loop(capacity, loop_count, timeout_ms)
        }
    }

    /// Requests a stop. Safe from any thread and from inside handlers.
    ///
    /// Reports [`Error::Already`] when the loop is not running or a stop is
    /// already in flight. The loop thread is woken through the self-pipe
    /// only when it is actually blocked in a wait.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    /// Installs a hook the loop invokes exactly once, after it has fully
    /// stopped (state already `Stopped`, signal mask restored).
    pub fn set_stop_hook<F: FnOnce() + Send + 'static>(&self, hook: F) {
        let mut slot = self
            .inner
            .stop_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Box::new(hook));
    }

    /// Detached handle to this engine for use by handlers and other
    /// threads.
    pub fn control(&self) -> LoopControl {
        let ops: Arc<dyn ControlOps + Send + Sync> = self.inner.clone();
        LoopControl {
            ops: Arc::downgrade(&ops),
        }
    }

    /// Stops the loop and joins the worker thread, if any. Called by
    /// `Drop`; explicit callers get the worker's exit result.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.inner.stop() {
            Ok(()) | Err(Error::Already) => {}
            Err(e) => return Err(e),
        }
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                // shutdown from inside a handler on the worker itself;
                // joining would deadlock.
                return Ok(());
            }
            return worker
                .join()
                .unwrap_or(Err(Error::InvalidArgument("loop thread panicked")));
        }
        Ok(())
    }
}

impl<M: Multiplexer + 'static> Drop for EventLoop<M> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("event loop shutdown failed: {e}");
        }
    }
}

impl LoopControl {
    pub fn stop(&self) -> Result<()> {
        match self.ops.upgrade() {
            Some(ops) => ops.stop(),
            None => Err(Error::Already),
        }
    }

    pub fn remove_handler(&self, id: HandlerId) -> Result<()> {
        match self.ops.upgrade() {
            Some(ops) => ops.remove_token(id.token),
            None => Err(Error::NotFound),
        }
    }
}

impl<M: Multiplexer> ControlOps for Inner<M> {
    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            RunState::Stopped | RunState::StopRequested => Err(Error::Already),
            RunState::StartRequested => {
                // The loop thread has not entered a wait yet; it observes
                // the request when it tries to start.
                *state = RunState::StopRequested;
                Ok(())
            }
            RunState::Started => {
                *state = RunState::StopRequested;
                self.wake();
                Ok(())
            }
        }
    }

    fn remove_token(&self, token: u64) -> Result<()> {
        let slot = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&token) {
                Some(slot) => Arc::clone(slot),
                None => return Err(Error::NotFound),
            }
        };

        match slot.state() {
            STATE_DELETED | STATE_DELETE_PENDING => return Err(Error::Already),
            _ => {}
        }

        let result = match slot.hooks.try_lock() {
            Ok(_guard) => {
                if !slot.mark_deleted() {
                    return Err(Error::Already);
                }
                self.deregister(&slot);
                self.handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&token);
                Ok(())
            }
            Err(_) => {
                // Mid-dispatch; the loop thread completes the removal once
                // the callback returns.
                slot.mark_delete_pending();
                self.wake();
                Ok(())
            }
        };
        result
    }
}

impl<M: Multiplexer> Inner<M> {
    fn register(
        &self,
        source: &dyn EventSource,
        requested: Interest,
        on_event: EventFn,
        on_cancel: Option<CancelFn>,
    ) -> Result<HandlerId> {
        let fd = source.descriptor();
        let timer_interval = source.timer_interval();
        if fd < 0 && timer_interval.is_none() {
            return Err(Error::InvalidArgument("source has no descriptor"));
        }
        if requested.is_empty() {
            return Err(Error::InvalidArgument("empty interest"));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        match timer_interval {
            Some(interval) => self.mux.add_timer(fd, interval, token)?,
            None => match self.mux.add(fd, token, requested) {
                Err(Error::Io(e)) if e.raw_os_error() == Some(libc::EEXIST) => {
                    return Err(Error::Already);
                }
                other => other?,
            },
        }

        let slot = Arc::new(HandlerSlot::new(
            fd,
            token,
            requested,
            timer_interval.is_some(),
            on_event,
            on_cancel,
        ));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token, slot);
        Ok(HandlerId { token })
    }

    fn deregister(&self, slot: &HandlerSlot) {
        let result = if slot.timer {
            self.mux.remove_timer(slot.fd)
        } else {
            self.mux.remove(slot.fd)
        };
        match result {
            Ok(()) | Err(Error::Already) => {}
            Err(e) => log::warn!("deregistering fd {} failed: {e}", slot.fd),
        }
    }

    fn wake(&self) {
        let buf = [0u8; 1];
        let ret = unsafe { libc::write(self.control_tx.as_raw_fd(), buf.as_ptr().cast(), 1) };
        // EAGAIN means a wake is already pending, which is just as good.
        if ret < 0 && nix::errno::Errno::last() != nix::errno::Errno::EAGAIN {
            log::error!("waking event loop failed: {}", Error::last_os());
        }
    }

    fn drain_control(&self) {
        let mut buf = [0u8; 16];
        loop {
            let ret = unsafe {
                libc::read(self.control_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if ret < (buf.len() as isize) {
                break;
            }
        }
    }

    fn run_loop(&self, capacity: usize, mut loop_count: i64, timeout_ms: i32) -> Result<()> {
        let saved_mask = match mask_all() {
            Ok(mask) => mask,
            Err(e) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                *state = RunState::Stopped;
                return Err(e);
            }
        };

        let mut watch = None;
        if self.handle_signals {
            match self.install_signal_watch() {
                Ok(w) => watch = w,
                Err(e) => {
                    restore_mask(&saved_mask);
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    *state = RunState::Stopped;
                    return Err(e);
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == RunState::StartRequested {
                *state = RunState::Started;
                log::debug!("event loop started");
            }
            // Anything else is a stop that arrived before we got going; the
            // main loop below exits on its first state check.
        }

        let mut buf: Vec<ReadyEvent> = Vec::with_capacity(capacity);
        let mut result = Ok(());

        loop {
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if *state != RunState::Started {
                    break;
                }
            }
            if loop_count == 0 {
                break;
            }
            if loop_count > 0 {
                loop_count -= 1;
            }

            match self.mux.wait(&mut buf, capacity, timeout_ms) {
                Ok(_) => {}
                Err(Error::Interrupted) => {
                    if let Some(w) = watch.as_mut() {
                        w.drain();
                    }
                    continue;
                }
                Err(Error::TimedOut) => break,
                Err(e) => {
                    log::error!("wait failed: {e}");
                    result = Err(e);
                    break;
                }
            }

            for ev in buf.drain(..) {
                match ev.token {
                    CONTROL_TOKEN => self.drain_control(),
                    SIGNAL_TOKEN => {
                        if let Some(w) = watch.as_mut() {
                            w.drain();
                        }
                    }
                    token => self.dispatch(token, ev.readiness),
                }
            }
        }

        if let Some(w) = watch.take() {
            match self.mux.remove(w.descriptor()) {
                Ok(()) | Err(Error::Already) => {}
                Err(e) => log::warn!("deregistering signal watch failed: {e}"),
            }
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = RunState::Stopped;
        }
        restore_mask(&saved_mask);
        log::debug!("event loop stopped");

        let hook = self
            .stop_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            hook();
        }

        result
    }

    fn install_signal_watch(&self) -> Result<Option<SignalWatch>> {
        let watch = SignalWatch::install()?;
        if watch.descriptor() >= 0 {
            self.mux
                .add(watch.descriptor(), SIGNAL_TOKEN, interest().read())?;
            Ok(Some(watch))
        } else {
            // No signal descriptor on this platform; masking is all we do.
            Ok(None)
        }
    }

    fn dispatch(&self, token: u64, readiness: Readiness) {
        let slot = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&token) {
                Some(slot) => Arc::clone(slot),
                // Removed between wait and dispatch; stale event.
                None => return,
            }
        };

        if slot.state() == STATE_DELETED {
            return;
        }
        let fired = readiness.filter(slot.interest);
        if fired.is_empty() {
            return;
        }

        let mut guard = match slot.hooks.try_lock() {
            Ok(guard) => guard,
            // An external remover holds the slot right now; it will either
            // finish the removal or release it before the next wait.
            Err(_) => return,
        };
        // A remover may have completed the real removal between the state
        // check above and this lock acquisition.
        if slot.state() == STATE_DELETED {
            return;
        }

        let verdict = (guard.on_event)(slot.fd, fired);

        if verdict == Dispatch::Cancel || slot.state() == STATE_DELETE_PENDING {
            if !slot.mark_deleted() {
                return;
            }
            self.deregister(&slot);
            self.handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&token);
            let cancel = guard.on_cancel.take();
            drop(guard);
            if let Some(cancel) = cancel {
                cancel(slot.fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Barrier};
    use std::time::Duration;

    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;

    use super::*;

    #[test]
    fn stop_before_run_reports_already() {
        let engine = EventLoop::new(false, false).unwrap();
        assert!(matches!(engine.stop(), Err(Error::Already)));
    }

    #[test]
    fn never_run_engine_drops_immediately() {
        let engine = EventLoop::new(true, false).unwrap();
        drop(engine);
    }

    #[test]
    fn run_rejects_bad_arguments() {
        let mut engine = EventLoop::new(false, false).unwrap();
        assert!(matches!(
            engine.run(0, -1, -1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.run(4, 0, -1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.run(4, -1, -2),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn sync_run_exits_on_wait_timeout() {
        let mut engine = EventLoop::new(false, false).unwrap();
        engine.run(4, -1, 20).unwrap();
        // Loop ended cleanly, so it can be started again.
        engine.run(4, -1, 20).unwrap();
    }

    #[test]
    fn sync_run_honors_loop_count() {
        let mut engine = EventLoop::new(false, false).unwrap();
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        // Keep the pipe permanently readable; only loop_count can end the
        // run.
        nix::unistd::write(&tx, b"xxxx").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        engine
            .add_handler(&rx, interest().read(), move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Dispatch::Renew
            })
            .unwrap();

        engine.run(4, 3, 1000).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancel_verdict_removes_handler_and_fires_hook() {
        let mut engine = EventLoop::new(false, false).unwrap();
        let control = engine.control();
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        nix::unistd::write(&tx, b"abcde").unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let cancels = Arc::new(AtomicUsize::new(0));
        let read_count = Arc::clone(&reads);
        let cancel_count = Arc::clone(&cancels);
        engine
            .add_handler_with_cancel(
                &rx,
                interest().read(),
                move |fd, ready| {
                    assert!(ready.is_readable());
                    let mut byte = [0u8; 1];
                    unsafe { libc::read(fd, byte.as_mut_ptr().cast(), 1) };
                    if read_count.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        Dispatch::Cancel
                    } else {
                        Dispatch::Renew
                    }
                },
                move |_| {
                    cancel_count.fetch_add(1, Ordering::SeqCst);
                    control.stop().unwrap();
                },
            )
            .unwrap();

        engine.run(8, -1, -1).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn threaded_run_dispatches_and_stops() {
        let mut engine = EventLoop::new(true, false).unwrap();
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();

        let (seen_tx, seen_rx) = mpsc::channel();
        engine
            .add_handler(&rx, interest().read(), move |fd, _| {
                let mut byte = [0u8; 1];
                unsafe { libc::read(fd, byte.as_mut_ptr().cast(), 1) };
                seen_tx.send(byte[0]).unwrap();
                Dispatch::Renew
            })
            .unwrap();

        engine.run(4, -1, -1).unwrap();
        nix::unistd::write(&tx, b"k").unwrap();
        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(), b'k');

        engine.stop().unwrap();
        assert!(matches!(engine.stop(), Err(Error::Already)));
        engine.shutdown().unwrap();
    }

    #[test]
    fn stop_hook_runs_once_after_loop_ends() {
        let mut engine = EventLoop::new(false, false).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = Arc::clone(&fired);
        engine.set_stop_hook(move || {
            hook_fired.fetch_add(1, Ordering::SeqCst);
        });

        engine.run(4, -1, 20).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // A second run has no hook left to fire.
        engine.run(4, -1, 20).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_during_dispatch_defers_until_callback_returns() {
        let mut engine = EventLoop::new(true, false).unwrap();
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();

        let gate = Arc::new(Barrier::new(2));
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_gate = Arc::clone(&gate);
        let handler_hits = Arc::clone(&hits);
        let id = engine
            .add_handler(&rx, interest().read(), move |fd, _| {
                let mut byte = [0u8; 1];
                unsafe { libc::read(fd, byte.as_mut_ptr().cast(), 1) };
                handler_hits.fetch_add(1, Ordering::SeqCst);
                handler_gate.wait(); // entered
                handler_gate.wait(); // released
                Dispatch::Renew
            })
            .unwrap();

        engine.run(4, -1, -1).unwrap();
        nix::unistd::write(&tx, b"a").unwrap();
        gate.wait(); // handler is mid-dispatch now

        // The slot is in use, so this parks it delete-pending instead of
        // blocking, and still succeeds.
        engine.remove_handler(id).unwrap();
        gate.wait(); // let the callback return

        // The dispatcher finished the removal; further readiness never
        // reaches the handler.
        nix::unistd::write(&tx, b"b").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        engine.stop().unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn externally_removed_handler_is_never_dispatched_again() {
        let engine = EventLoop::new(false, false).unwrap();
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        nix::unistd::write(&tx, b"x").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = engine
            .add_handler(&rx, interest().read(), move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Dispatch::Renew
            })
            .unwrap();
        let token = id.token;

        // Stale strong reference, as the dispatcher holds between its map
        // lookup and the callback invocation.
        let stale = {
            let handlers = engine.inner.handlers.lock().unwrap();
            Arc::clone(handlers.get(&token).unwrap())
        };
        engine.remove_handler(id).unwrap();
        assert_eq!(stale.state(), crate::handler::STATE_DELETED);

        // The lock is free again after the removal; a dispatch racing with
        // it must still not reach the callback.
        engine
            .inner
            .handlers
            .lock()
            .unwrap()
            .insert(token, Arc::clone(&stale));
        engine
            .inner
            .dispatch(token, Readiness::from_bits(crate::interest::READ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_handler_twice_is_unrepresentable_but_stale_token_reports_not_found() {
        let engine = EventLoop::new(false, false).unwrap();
        let (rx, _tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let id = engine
            .add_handler(&rx, interest().read(), |_, _| Dispatch::Renew)
            .unwrap();
        engine.remove_handler(id).unwrap();

        // Forged token, same value the consumed id had.
        let stale = HandlerId { token: FIRST_USER_TOKEN };
        assert!(matches!(engine.remove_handler(stale), Err(Error::NotFound)));
    }

    #[test]
    fn duplicate_descriptor_registration_reports_already() {
        let engine = EventLoop::new(false, false).unwrap();
        let (rx, _tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        engine
            .add_handler(&rx, interest().read(), |_, _| Dispatch::Renew)
            .unwrap();
        assert!(matches!(
            engine.add_handler(&rx, interest().read(), |_, _| Dispatch::Renew),
            Err(Error::Already)
        ));
    }

    #[cfg(feature = "mock")]
    mod mocked {
        use mockall::predicate::eq;

        use super::*;
        use crate::sys::MockMultiplexer;

        #[test]
        fn registration_reaches_the_multiplexer_with_fresh_tokens() {
            let mut mock = MockMultiplexer::new();
            mock.expect_add()
                .withf(|_, token, _| *token == CONTROL_TOKEN)
                .times(1)
                .returning(|_, _, _| Ok(()));
            mock.expect_add()
                .withf(|_, token, _| *token == FIRST_USER_TOKEN)
                .times(1)
                .returning(|_, _, _| Ok(()));
            mock.expect_remove().with(eq(5)).times(1).returning(|_| Ok(()));

            let engine = EventLoop::with_multiplexer(mock, false, false).unwrap();
            let id = engine
                .add_handler(&5, interest().read(), |_, _| Dispatch::Renew)
                .unwrap();
            engine.remove_handler(id).unwrap();
        }

        #[test]
        fn failed_run_leaves_engine_restartable() {
            let mut seq = mockall::Sequence::new();
            let mut mock = MockMultiplexer::new();
            mock.expect_add().returning(|_, _, _| Ok(()));
            mock.expect_wait()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| {
                    Err(Error::Io(std::io::Error::from_raw_os_error(libc::EBADF)))
                });
            mock.expect_wait()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Err(Error::TimedOut));

            let mut engine = EventLoop::with_multiplexer(mock, false, false).unwrap();
            assert!(matches!(engine.run(4, -1, 50), Err(Error::Io(_))));
            // The failure rolled the state back; the engine is not bricked.
            engine.run(4, -1, 50).unwrap();
        }

        #[test]
        fn timed_out_wait_ends_the_run_cleanly() {
            let mut mock = MockMultiplexer::new();
            mock.expect_add().returning(|_, _, _| Ok(()));
            mock.expect_wait()
                .times(1)
                .returning(|_, _, _| Err(Error::TimedOut));

            let mut engine = EventLoop::with_multiplexer(mock, false, false).unwrap();
            engine.run(4, -1, 50).unwrap();
        }
    }
}
