//! Readiness-driven event core for pluggable inference backends.
//!
//! The crate layers three pieces:
//!
//! - [`EventLoop`]: one multiplexer (epoll on Linux, kqueue on macOS)
//!   behind the [`Multiplexer`] trait, dispatching to registered handlers
//!   with removal that is safe mid-dispatch and cross-thread.
//! - [`CommandChannel`]: pipe- or socketpair-backed frames carrying a
//!   command id plus ownership of a boxed payload.
//! - [`AsyncAdapter`]: confines a blocking [`InferenceRuntime`] to a
//!   worker engine and exposes completion events and output tensors
//!   through descriptors a consumer wires into its own loop.

mod adapter;
mod channel;
mod engine;
mod error;
mod event;
mod handler;
mod interest;
mod notify;
mod runtime;
mod signal;
mod source;
mod sys;

pub use crate::adapter::{AsyncAdapter, CommandId, OutputPolicy};
pub use crate::channel::{duplex, queue, CommandChannel};
pub use crate::engine::{EventLoop, LoopControl, DEFAULT_WAIT_CAPACITY};
pub use crate::error::{Error, Result};
pub use crate::event::{EventData, EventKind, EventPayload, ReadyEvent, Readiness};
pub use crate::handler::{Dispatch, HandlerId};
pub use crate::interest::{interest, Interest};
pub use crate::notify::{event_outlet, EventOutlet, EventPublisher, OutletHandlerId};
pub use crate::runtime::{
    InferenceRuntime, RuntimeConfig, Tensor, TensorInfo, TensorType,
};
#[cfg(feature = "mock")]
pub use crate::runtime::MockInferenceRuntime;
pub use crate::source::{EventSource, TimerSource};
pub use crate::sys::{Multiplexer, Poller};
#[cfg(feature = "mock")]
pub use crate::sys::MockMultiplexer;
