//! Passive socket state machine emitting accepted connections.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use log::warn;

use crate::broker::AcceptManager;
use crate::handle::AcceptHandle;
use crate::handler::{EventHandler, HandlerState, Operation};
use crate::multiplexer::Multiplexer;
use crate::sys::{self, NativeHandle, INVALID_NATIVE_HANDLE};

pub(crate) struct Acceptor {
    state: HandlerState,
    mgr: RefCell<Option<Rc<dyn AcceptManager>>>,
    // most recently accepted socket, consumed by the doorman before the
    // next new_connection
    latch: Cell<NativeHandle>,
}

impl Acceptor {
    pub(crate) fn new(fd: NativeHandle) -> io::Result<Acceptor> {
        sys::nonblocking(fd, true)?;
        Ok(Acceptor {
            state: HandlerState::new(fd),
            mgr: RefCell::new(None),
            latch: Cell::new(INVALID_NATIVE_HANDLE),
        })
    }

    pub(crate) fn hdl(&self) -> AcceptHandle {
        AcceptHandle::from_socket(self.fd())
    }

    pub(crate) fn start(self: Rc<Self>, dm: &Multiplexer, mgr: Rc<dyn AcceptManager>) {
        *self.mgr.borrow_mut() = Some(mgr);
        dm.add(Operation::Read, self.fd(), self.clone());
    }

    pub(crate) fn stop_reading(self: Rc<Self>, dm: &Multiplexer) {
        self.state.close_read_channel();
        dm.del(Operation::Read, self.fd(), Some(self.clone()));
    }

    /// Moves the latched socket out.
    pub(crate) fn accepted_socket(&self) -> Option<NativeHandle> {
        match self.latch.replace(INVALID_NATIVE_HANDLE) {
            INVALID_NATIVE_HANDLE => None,
            fd => Some(fd),
        }
    }
}

impl EventHandler for Acceptor {
    fn state(&self) -> &HandlerState {
        &self.state
    }

    fn handle_event(self: Rc<Self>, dm: &Multiplexer, op: Operation) {
        let mgr = self.mgr.borrow().clone();
        if let (Some(mgr), Operation::Read) = (mgr, op) {
            match sys::try_accept(self.fd()) {
                Ok(Some(sock)) => {
                    let stale = self.latch.replace(sock);
                    sys::close_socket(stale);
                    mgr.new_connection(dm, self.hdl());
                }
                Ok(None) => {}
                Err(err) => warn!("accept failed on socket {}: {err}", self.fd()),
            }
        }
    }

    fn removed_from_loop(&self, op: Operation) {
        if op == Operation::Read {
            self.mgr.borrow_mut().take();
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        sys::close_socket(self.latch.get());
        sys::close_socket(self.fd());
    }
}
