use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use crate::event::Readiness;
use crate::interest::Interest;

/// Verdict returned by an event handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// Keep the handler registered.
    Renew,
    /// Remove the handler; the engine completes the removal and then
    /// invokes the cancel hook, if one was given.
    Cancel,
}

pub type EventFn = Box<dyn FnMut(RawFd, Readiness) -> Dispatch + Send>;
pub type CancelFn = Box<dyn FnOnce(RawFd) + Send>;

/// Opaque, single-owner handle to a registered handler.
///
/// `EventLoop::remove_handler` consumes it, so an external double-remove is
/// unrepresentable. Deliberately neither `Clone` nor `Copy`.
#[derive(Debug, Eq, PartialEq)]
pub struct HandlerId {
    pub(crate) token: u64,
}

// Handler slot states. IN_USE is not a state: it is the mutual-exclusion
// guard realized by `HandlerSlot::hooks.try_lock()`.
pub(crate) const STATE_INIT: u8 = 0;
pub(crate) const STATE_DELETE_PENDING: u8 = 1;
pub(crate) const STATE_DELETED: u8 = 2;

pub(crate) struct Hooks {
    pub on_event: EventFn,
    pub on_cancel: Option<CancelFn>,
}

/// One registration: descriptor, interest mask, callbacks and dispatch
/// state. Owned by the engine that created it; reaches `STATE_DELETED`
/// exactly once, and only through the engine's removal paths.
pub(crate) struct HandlerSlot {
    pub fd: RawFd,
    pub token: u64,
    pub interest: Interest,
    pub timer: bool,
    state: AtomicU8,
    pub hooks: Mutex<Hooks>,
}

impl HandlerSlot {
    pub fn new(
        fd: RawFd,
        token: u64,
        interest: Interest,
        timer: bool,
        on_event: EventFn,
        on_cancel: Option<CancelFn>,
    ) -> Self {
        Self {
            fd,
            token,
            interest,
            timer,
            state: AtomicU8::new(STATE_INIT),
            hooks: Mutex::new(Hooks {
                on_event,
                on_cancel,
            }),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn mark_delete_pending(&self) {
        self.state.store(STATE_DELETE_PENDING, Ordering::Release);
    }

    /// Transitions to DELETED. Returns `false` if the slot was already
    /// deleted, so the caller can detect a lost race with another remover.
    pub fn mark_deleted(&self) -> bool {
        self.state.swap(STATE_DELETED, Ordering::AcqRel) != STATE_DELETED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::interest;

    fn slot() -> HandlerSlot {
        HandlerSlot::new(
            3,
            10,
            interest().read(),
            false,
            Box::new(|_, _| Dispatch::Renew),
            None,
        )
    }

    #[test]
    fn deleted_is_reached_exactly_once() {
        let s = slot();
        assert_eq!(s.state(), STATE_INIT);
        assert!(s.mark_deleted());
        assert!(!s.mark_deleted());
        assert_eq!(s.state(), STATE_DELETED);
    }

    #[test]
    fn try_lock_acts_as_in_use_guard() {
        let s = slot();
        let guard = s.hooks.try_lock();
        assert!(guard.is_ok());
        // A second dispatcher (or remover) must fail the test-and-set.
        assert!(s.hooks.try_lock().is_err());
        drop(guard);
        assert!(s.hooks.try_lock().is_ok());
    }

    #[test]
    fn delete_pending_survives_until_deleted() {
        let s = slot();
        s.mark_delete_pending();
        assert_eq!(s.state(), STATE_DELETE_PENDING);
        assert!(s.mark_deleted());
        assert_eq!(s.state(), STATE_DELETED);
    }
}
