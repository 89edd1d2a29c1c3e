use downcast_rs::{impl_downcast, Downcast};

use crate::interest::{self, Interest};

/// Readiness reported by the multiplexer for one descriptor, already
/// translated out of the OS-specific representation.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Readiness(u32);

impl Readiness {
    pub(crate) const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the descriptor is readable.
    pub const fn is_readable(&self) -> bool {
        self.0 & interest::READ != 0
    }

    /// Returns `true` if the descriptor is writable.
    pub const fn is_writable(&self) -> bool {
        self.0 & interest::WRITE != 0
    }

    /// Returns `true` if an error condition (or a peer hang-up) was
    /// reported on the descriptor.
    pub const fn is_error(&self) -> bool {
        self.0 & interest::ERROR != 0
    }

    /// Keeps only the bits a handler actually asked for. An empty result
    /// means the wake was spurious for this handler.
    pub(crate) const fn filter(&self, requested: Interest) -> Readiness {
        Readiness(self.0 & requested.bits())
    }
}

/// One entry of the ready-list a `wait` call fills in: the registration
/// token and the translated readiness.
#[derive(Copy, Clone, Debug)]
pub struct ReadyEvent {
    pub token: u64,
    pub readiness: Readiness,
}

/// Module-level event classification, published through a notify outlet
/// and consumed by `fetch_event_data`.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct EventKind(u32);

impl EventKind {
    pub const NONE: EventKind = EventKind(0);
    pub const READ: EventKind = EventKind(0x01);
    pub const WRITE: EventKind = EventKind(0x02);
    pub const ERROR: EventKind = EventKind(0x04);
    pub const INFERENCE_SUCCESS: EventKind = EventKind(0x10);
    pub const INFERENCE_ERROR: EventKind = EventKind(0x20);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn union(self, other: EventKind) -> EventKind {
        EventKind(self.0 | other.0)
    }

    /// Returns `true` if any bit of `other` is present in `self`.
    pub const fn intersects(&self, other: EventKind) -> bool {
        self.0 & other.0 != 0
    }
}

/// Opaque, downcastable payload attached to an [`EventData`].
///
/// Modules agree out of band on the concrete type they exchange; the core
/// never inspects it.
pub trait EventPayload: Downcast + Send {}
impl_downcast!(EventPayload);

impl<T: std::any::Any + Send> EventPayload for T {}

/// The record a notify outlet transports: what happened, plus whatever
/// context the producer attached.
pub struct EventData {
    pub kind: EventKind,
    pub payload: Option<Box<dyn EventPayload>>,
}

impl EventData {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn with_payload(kind: EventKind, payload: Box<dyn EventPayload>) -> Self {
        Self {
            kind,
            payload: Some(payload),
        }
    }
}

impl std::fmt::Debug for EventData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventData")
            .field("kind", &self.kind)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::interest;

    #[test]
    fn readiness_filter_masks_unrequested_bits() {
        let reported = Readiness::from_bits(interest::READ | interest::ERROR);
        let fired = reported.filter(interest().read());
        assert!(fired.is_readable());
        assert!(!fired.is_error());
    }

    #[test]
    fn event_payload_downcasts() {
        let data = EventData::with_payload(EventKind::INFERENCE_SUCCESS, Box::new(42u32));
        let payload = data.payload.unwrap();
        assert_eq!(payload.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn kind_intersection() {
        let k = EventKind::INFERENCE_ERROR.union(EventKind::ERROR);
        assert!(k.intersects(EventKind::ERROR));
        assert!(!k.intersects(EventKind::READ));
    }
}
