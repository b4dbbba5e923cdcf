//! Common state and capability surface shared by every socket participant
//! of the event loop.

use std::cell::Cell;
use std::rc::Rc;

use log::error;

use crate::backend::{INPUT_MASK, OUTPUT_MASK};
use crate::multiplexer::Multiplexer;
use crate::sys::{self, NativeHandle, INVALID_NATIVE_HANDLE};

/// I/O direction of a readiness event delivered to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    PropagateError,
}

/// Interest mask as installed with the OS readiness primitive. Error
/// conditions are always observed and never part of the mask.
pub(crate) type EventMask = i32;

pub(crate) fn add_flag(op: Operation, bf: EventMask) -> EventMask {
    match op {
        Operation::Read => bf | INPUT_MASK,
        Operation::Write => bf | OUTPUT_MASK,
        Operation::PropagateError => {
            error!("cannot add interest in error propagation");
            bf
        }
    }
}

pub(crate) fn del_flag(op: Operation, bf: EventMask) -> EventMask {
    match op {
        Operation::Read => bf & !INPUT_MASK,
        Operation::Write => bf & !OUTPUT_MASK,
        Operation::PropagateError => {
            error!("cannot delete interest in error propagation");
            bf
        }
    }
}

/// Base state of a loop participant: the descriptor, the interest mask last
/// reconciled with the kernel and the read-channel flag.
pub(crate) struct HandlerState {
    fd: NativeHandle,
    eventbf: Cell<EventMask>,
    read_channel_closed: Cell<bool>,
}

impl HandlerState {
    pub(crate) fn new(fd: NativeHandle) -> HandlerState {
        HandlerState {
            fd,
            eventbf: Cell::new(0),
            read_channel_closed: Cell::new(false),
        }
    }

    /// Shuts the read direction down at the OS level. Further read readiness
    /// for this descriptor is ignored by the dispatcher.
    pub(crate) fn close_read_channel(&self) {
        if self.fd == INVALID_NATIVE_HANDLE || self.read_channel_closed.get() {
            return;
        }
        let _ = sys::shutdown_read(self.fd);
        self.read_channel_closed.set(true);
    }
}

/// Capability set of a loop participant. Dispatch happens through
/// `Rc<dyn EventHandler>` entries held by the readiness set; every entry
/// point borrows the owning multiplexer, which outlives its handlers.
pub(crate) trait EventHandler {
    fn state(&self) -> &HandlerState;

    /// Reacts to one readiness event.
    fn handle_event(self: Rc<Self>, dm: &Multiplexer, op: Operation);

    /// Invoked after a direction transitioned from installed to removed.
    fn removed_from_loop(&self, op: Operation);

    fn fd(&self) -> NativeHandle {
        self.state().fd
    }

    fn eventbf(&self) -> EventMask {
        self.state().eventbf.get()
    }

    fn set_eventbf(&self, mask: EventMask) {
        self.state().eventbf.set(mask)
    }

    fn read_channel_closed(&self) -> bool {
        self.state().read_channel_closed.get()
    }
}
