//! This module defines `Interest`, the platform-independent bitmask used to
//! specify which readiness events a handler wants for its descriptor.
//!
//! The backend (`sys::epoll` / `sys::kqueue`) translates an `Interest` into
//! the OS-specific flag set at registration time, and translates reported
//! events back into a [`Readiness`](crate::Readiness) at dispatch time.

/// Represents interest in I/O readiness events.
///
/// Provides a fluent const API for building an interest set out of the three
/// abstract bits the framework knows about: READ, WRITE and ERROR.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Interest(u32);

pub(crate) const READ: u32 = 0x01;
pub(crate) const WRITE: u32 = 0x02;
pub(crate) const ERROR: u32 = 0x04;

impl Interest {
    pub(crate) const fn bits(&self) -> u32 {
        self.0
    }

    /// Returns `true` if no bit is set. An empty interest is not
    /// registrable.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Adds readable interest.
    pub const fn read(self) -> Self {
        Self(self.0 | READ)
    }

    /// Adds writable interest.
    pub const fn write(self) -> Self {
        Self(self.0 | WRITE)
    }

    /// Adds error interest.
    ///
    /// Error conditions are reported by the OS whether or not they were
    /// requested; this bit only controls whether the handler gets to see
    /// them.
    pub const fn error(self) -> Self {
        Self(self.0 | ERROR)
    }

    pub const fn is_read(&self) -> bool {
        self.0 & READ != 0
    }

    pub const fn is_write(&self) -> bool {
        self.0 & WRITE != 0
    }

    pub const fn is_error(&self) -> bool {
        self.0 & ERROR != 0
    }
}

/// Creates a new, empty `Interest` set.
///
/// The starting point for building an interest set using the fluent API.
pub const fn interest() -> Interest {
    Interest(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_composes_bits() {
        let i = interest().read().error();
        assert!(i.is_read());
        assert!(i.is_error());
        assert!(!i.is_write());
        assert!(!i.is_empty());
    }

    #[test]
    fn empty_interest_is_empty() {
        assert!(interest().is_empty());
    }
}
