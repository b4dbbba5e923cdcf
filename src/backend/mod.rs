//! OS readiness strategies. Linux uses `epoll` unless the `poll` feature
//! forces the portable strategy; every other unix target uses `poll`. Both
//! strategies expose the same surface, only the readiness data structure
//! and the reconciliation of queued registration changes differ.

use std::rc::Rc;

use crate::handler::{EventHandler, EventMask};
use crate::sys::NativeHandle;

#[cfg(all(target_os = "linux", not(feature = "poll")))]
mod epoll;
#[cfg(all(target_os = "linux", not(feature = "poll")))]
pub(crate) use epoll::{ReadinessSet, ERROR_MASK, INPUT_MASK, OUTPUT_MASK};

#[cfg(any(not(target_os = "linux"), feature = "poll"))]
mod poll;
#[cfg(any(not(target_os = "linux"), feature = "poll"))]
pub(crate) use poll::{ReadinessSet, ERROR_MASK, INPUT_MASK, OUTPUT_MASK};

/// A queued registration change, applied at the end of the loop iteration
/// that enqueued it. The handler is absent only for the wake-up pipe's read
/// end.
pub(crate) struct PendingEvent {
    pub fd: NativeHandle,
    pub mask: EventMask,
    pub handler: Option<Rc<dyn EventHandler>>,
}

/// One readiness event as reported by the OS, snapshotted together with its
/// handler before any callback runs.
pub(crate) struct Ready {
    pub fd: NativeHandle,
    pub mask: EventMask,
    pub handler: Option<Rc<dyn EventHandler>>,
}

/// A direction that transitioned from installed to removed during
/// reconciliation; the handler is notified once the readiness set is no
/// longer borrowed.
pub(crate) type RemovedFromLoop = (Rc<dyn EventHandler>, crate::handler::Operation);
