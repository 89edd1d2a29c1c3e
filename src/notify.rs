//! Event notification between modules.
//!
//! A publisher pushes [`EventData`] records into a pipe; the outlet end is
//! an [`EventSource`], so a consumer registers it with its own engine and
//! calls [`EventOutlet::fetch_event_data`] when the descriptor turns
//! readable. The outlet also carries a local handler list so a consumer
//! can subscribe callbacks per event kind instead of polling.

use std::os::fd::{BorrowedFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::channel::{self, CommandChannel};
use crate::error::{Error, Result};
use crate::event::{EventData, EventKind};
use crate::handler::Dispatch;
use crate::source::EventSource;

// All notify frames carry the same id; the payload kind is the routing key.
const NOTIFY_FRAME_ID: i32 = 0;

type OutletFn = Box<dyn FnMut(&EventData) -> Dispatch + Send>;

/// Single-owner handle to a subscribed outlet callback.
#[derive(Debug, Eq, PartialEq)]
pub struct OutletHandlerId(u64);

struct OutletEntry {
    id: u64,
    kinds: EventKind,
    callback: OutletFn,
}

/// Producing end of a notify pair. Cheap to move into a worker thread.
pub struct EventPublisher {
    tx: CommandChannel<EventData>,
}

/// Consuming end of a notify pair.
pub struct EventOutlet {
    rx: CommandChannel<EventData>,
    entries: Vec<OutletEntry>,
    next_id: u64,
}

/// Creates a connected outlet/publisher pair.
pub fn event_outlet() -> Result<(EventOutlet, EventPublisher)> {
    let (rx, tx) = channel::queue::<EventData>()?;
    Ok((
        EventOutlet {
            rx,
            entries: Vec::new(),
            next_id: 0,
        },
        EventPublisher { tx },
    ))
}

impl EventPublisher {
    /// Queues one event record for the outlet. Never blocks the consumer;
    /// the record waits in the pipe until fetched.
    pub fn publish(&self, data: Box<EventData>) -> Result<()> {
        self.tx.send(NOTIFY_FRAME_ID, data)
    }
}

impl EventOutlet {
    /// Takes the next pending event record, if any, running subscribed
    /// callbacks on the way out. Reports [`Error::WouldBlock`] when the
    /// queue is empty rather than blocking.
    pub fn fetch_event_data(&mut self) -> Result<EventData> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.rx.descriptor()) };
        let mut probe = [PollFd::new(fd, PollFlags::POLLIN)];
        let ready = poll(&mut probe, PollTimeout::ZERO)?;
        if ready == 0 {
            return Err(Error::WouldBlock);
        }

        let (_, data) = self.rx.recv()?;
        self.deliver(&data);
        Ok(*data)
    }

    /// Subscribes a callback for events whose kind intersects `kinds`. The
    /// callback may return [`Dispatch::Cancel`] to unsubscribe itself.
    pub fn add_handler<F>(&mut self, kinds: EventKind, callback: F) -> OutletHandlerId
    where
        F: FnMut(&EventData) -> Dispatch + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(OutletEntry {
            id,
            kinds,
            callback: Box::new(callback),
        });
        OutletHandlerId(id)
    }

    pub fn remove_handler(&mut self, id: OutletHandlerId) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id.0);
        if self.entries.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn deliver(&mut self, data: &EventData) {
        let mut cancelled = Vec::new();
        for entry in &mut self.entries {
            if !data.kind.intersects(entry.kinds) {
                continue;
            }
            if (entry.callback)(data) == Dispatch::Cancel {
                cancelled.push(entry.id);
            }
        }
        if !cancelled.is_empty() {
            self.entries.retain(|entry| !cancelled.contains(&entry.id));
        }
    }
}

impl EventSource for EventOutlet {
    fn descriptor(&self) -> RawFd {
        self.rx.descriptor()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn fetch_returns_published_record() {
        let (mut outlet, publisher) = event_outlet().unwrap();
        publisher
            .publish(Box::new(EventData::with_payload(
                EventKind::INFERENCE_SUCCESS,
                Box::new(17u32),
            )))
            .unwrap();

        let data = outlet.fetch_event_data().unwrap();
        assert_eq!(data.kind, EventKind::INFERENCE_SUCCESS);
        assert_eq!(data.payload.unwrap().downcast_ref::<u32>(), Some(&17));
    }

    #[test]
    fn fetch_on_empty_queue_would_block() {
        let (mut outlet, _publisher) = event_outlet().unwrap();
        assert!(matches!(outlet.fetch_event_data(), Err(Error::WouldBlock)));
    }

    #[test]
    fn callbacks_see_matching_kinds_only() {
        let (mut outlet, publisher) = event_outlet().unwrap();
        let errors = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let error_hits = Arc::clone(&errors);
        outlet.add_handler(EventKind::INFERENCE_ERROR, move |_| {
            error_hits.fetch_add(1, Ordering::SeqCst);
            Dispatch::Renew
        });
        let all_hits = Arc::clone(&all);
        outlet.add_handler(
            EventKind::INFERENCE_SUCCESS.union(EventKind::INFERENCE_ERROR),
            move |_| {
                all_hits.fetch_add(1, Ordering::SeqCst);
                Dispatch::Renew
            },
        );

        publisher
            .publish(Box::new(EventData::new(EventKind::INFERENCE_SUCCESS)))
            .unwrap();
        outlet.fetch_event_data().unwrap();

        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(all.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelling_callback_unsubscribes_itself() {
        let (mut outlet, publisher) = event_outlet().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        outlet.add_handler(EventKind::INFERENCE_SUCCESS, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Dispatch::Cancel
        });

        for _ in 0..2 {
            publisher
                .publish(Box::new(EventData::new(EventKind::INFERENCE_SUCCESS)))
                .unwrap();
        }
        outlet.fetch_event_data().unwrap();
        outlet.fetch_event_data().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_handler_on_unknown_id_reports_not_found() {
        let (mut outlet, _publisher) = event_outlet().unwrap();
        let id = outlet.add_handler(EventKind::READ, |_| Dispatch::Renew);
        outlet.remove_handler(id).unwrap();
        assert!(matches!(
            outlet.remove_handler(OutletHandlerId(0)),
            Err(Error::NotFound)
        ));
    }
}
