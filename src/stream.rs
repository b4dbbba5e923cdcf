//! Per-connection read/write state machine with configurable receive
//! policies and a two-buffer flush pipeline.

use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::rc::Rc;

use crate::broker::StreamManager;
use crate::handle::ConnectionHandle;
use crate::handler::{EventHandler, HandlerState, Operation};
use crate::multiplexer::Multiplexer;
use crate::sys::{self, NativeHandle};

/// Controls how many bytes a stream gathers before delivering them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePolicy {
    /// Deliver exactly this many bytes per `consume`.
    Exactly(usize),
    /// Deliver whatever arrived, up to this many bytes, as soon as it
    /// arrives.
    AtMost(usize),
    /// Deliver at least this many bytes per `consume`; the buffer keeps
    /// room for a little more to reduce the number of deliveries.
    AtLeast(usize),
}

pub(crate) const DEFAULT_RECEIVE_POLICY: ReceivePolicy = ReceivePolicy::AtMost(1024);

struct StreamInner {
    policy: ReceivePolicy,
    read_threshold: usize,
    collected: usize,
    rd_buf: Vec<u8>,
    written: usize,
    writing: bool,
    ack_writes: bool,
    wr_buf: Vec<u8>,
    wr_offline_buf: Vec<u8>,
}

impl StreamInner {
    /// Resets the read state and reshapes the buffer for the current policy.
    fn read_loop(&mut self) {
        self.collected = 0;
        match self.policy {
            ReceivePolicy::Exactly(max) => {
                if self.rd_buf.len() != max {
                    self.rd_buf.resize(max, 0);
                }
                self.read_threshold = max;
            }
            ReceivePolicy::AtMost(max) => {
                if self.rd_buf.len() != max {
                    self.rd_buf.resize(max, 0);
                }
                self.read_threshold = 1;
            }
            ReceivePolicy::AtLeast(max) => {
                // keep room for up to 10% more, but at least 100 bytes
                let max_size = max + usize::max(100, max / 10);
                if self.rd_buf.len() != max_size {
                    self.rd_buf.resize(max_size, 0);
                }
                self.read_threshold = max;
            }
        }
    }

    /// Prepares the next send cycle. Swaps the offline buffer in once the
    /// current one has fully drained; returns whether a send cycle remains.
    fn write_loop(&mut self) -> bool {
        self.written = 0;
        self.wr_buf.clear();
        if self.wr_offline_buf.is_empty() {
            self.writing = false;
            false
        } else {
            mem::swap(&mut self.wr_buf, &mut self.wr_offline_buf);
            true
        }
    }
}

pub(crate) struct Stream {
    state: HandlerState,
    launched: Cell<bool>,
    mgr: RefCell<Option<Rc<dyn StreamManager>>>,
    reader: RefCell<Option<Rc<dyn StreamManager>>>,
    writer: RefCell<Option<Rc<dyn StreamManager>>>,
    inner: RefCell<StreamInner>,
}

impl Stream {
    pub(crate) fn new(fd: NativeHandle) -> io::Result<Stream> {
        sys::prepare_socket(fd)?;
        let mut inner = StreamInner {
            policy: DEFAULT_RECEIVE_POLICY,
            read_threshold: 1,
            collected: 0,
            rd_buf: Vec::new(),
            written: 0,
            writing: false,
            ack_writes: false,
            wr_buf: Vec::new(),
            wr_offline_buf: Vec::new(),
        };
        inner.read_loop();
        Ok(Stream {
            state: HandlerState::new(fd),
            launched: Cell::new(false),
            mgr: RefCell::new(None),
            reader: RefCell::new(None),
            writer: RefCell::new(None),
            inner: RefCell::new(inner),
        })
    }

    pub(crate) fn hdl(&self) -> ConnectionHandle {
        ConnectionHandle::from_socket(self.fd())
    }

    pub(crate) fn set_manager(&self, mgr: Rc<dyn StreamManager>) {
        *self.mgr.borrow_mut() = Some(mgr);
    }

    pub(crate) fn manager(&self) -> Option<Rc<dyn StreamManager>> {
        self.mgr.borrow().clone()
    }

    pub(crate) fn launched(&self) -> bool {
        self.launched.get()
    }

    /// First call registers read interest under the stored manager;
    /// policy changes take effect on the next read cycle.
    pub(crate) fn configure_read(&self, policy: ReceivePolicy) {
        self.inner.borrow_mut().policy = policy;
    }

    pub(crate) fn set_ack_writes(&self, enable: bool) {
        self.inner.borrow_mut().ack_writes = enable;
    }

    pub(crate) fn launch(self: Rc<Self>, dm: &Multiplexer) {
        debug_assert!(!self.launched.get());
        self.launched.set(true);
        let mgr = self.mgr.borrow().clone();
        if let Some(mgr) = mgr {
            self.start(dm, mgr);
        }
    }

    pub(crate) fn start(self: Rc<Self>, dm: &Multiplexer, mgr: Rc<dyn StreamManager>) {
        *self.reader.borrow_mut() = Some(mgr);
        dm.add(Operation::Read, self.fd(), self.clone());
        self.inner.borrow_mut().read_loop();
    }

    /// Appends to the offline buffer without touching the socket.
    pub(crate) fn write(&self, buf: &[u8]) {
        self.inner.borrow_mut().wr_offline_buf.extend_from_slice(buf);
    }

    /// Starts draining pending writes unless a flush is already in flight.
    pub(crate) fn flush(self: Rc<Self>, dm: &Multiplexer, mgr: Rc<dyn StreamManager>) {
        let start = {
            let mut inner = self.inner.borrow_mut();
            if !inner.wr_offline_buf.is_empty() && !inner.writing {
                inner.writing = true;
                inner.write_loop();
                true
            } else {
                false
            }
        };
        if start {
            *self.writer.borrow_mut() = Some(mgr);
            dm.add(Operation::Write, self.fd(), self.clone());
        }
    }

    pub(crate) fn stop_reading(self: Rc<Self>, dm: &Multiplexer) {
        self.state.close_read_channel();
        dm.del(Operation::Read, self.fd(), Some(self.clone()));
    }

    fn handle_read(self: Rc<Self>, dm: &Multiplexer) {
        let res = {
            let mut inner = self.inner.borrow_mut();
            let collected = inner.collected;
            sys::read_some(self.fd(), &mut inner.rd_buf[collected..])
        };
        match res {
            Err(_) => {
                let reader = self.reader.borrow().clone();
                if let Some(reader) = reader {
                    reader.io_failure(dm, self.hdl(), Operation::Read);
                }
                dm.del(Operation::Read, self.fd(), Some(self.clone()));
            }
            Ok(0) => {}
            Ok(rb) => {
                let deliver = {
                    let mut inner = self.inner.borrow_mut();
                    inner.collected += rb;
                    inner.collected >= inner.read_threshold
                };
                if deliver {
                    // hand the buffer out without holding any borrow, the
                    // manager may reconfigure or write to this very stream
                    let (rd_buf, collected) = {
                        let mut inner = self.inner.borrow_mut();
                        let collected = inner.collected;
                        (mem::take(&mut inner.rd_buf), collected)
                    };
                    let reader = self.reader.borrow().clone();
                    if let Some(reader) = reader {
                        reader.consume(dm, self.hdl(), &rd_buf[..collected]);
                    }
                    let mut inner = self.inner.borrow_mut();
                    inner.rd_buf = rd_buf;
                    inner.read_loop();
                }
            }
        }
    }

    fn handle_write(self: Rc<Self>, dm: &Multiplexer) {
        let res = {
            let inner = self.inner.borrow();
            sys::write_some(self.fd(), &inner.wr_buf[inner.written..])
        };
        match res {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => {
                let writer = self.writer.borrow().clone();
                if let Some(writer) = writer {
                    writer.io_failure(dm, self.hdl(), Operation::Write);
                }
                dm.del(Operation::Write, self.fd(), Some(self.clone()));
            }
            Ok(0) => {}
            Ok(wb) => {
                let (ack, remaining_total, drained) = {
                    let mut inner = self.inner.borrow_mut();
                    inner.written += wb;
                    debug_assert!(inner.written <= inner.wr_buf.len());
                    let remaining = inner.wr_buf.len() - inner.written;
                    (inner.ack_writes, remaining + inner.wr_offline_buf.len(), remaining == 0)
                };
                if ack {
                    let writer = self.writer.borrow().clone();
                    if let Some(writer) = writer {
                        writer.data_transferred(dm, self.hdl(), wb, remaining_total);
                    }
                }
                // prepare the next send or stop sending
                if drained && !self.inner.borrow_mut().write_loop() {
                    dm.del(Operation::Write, self.fd(), Some(self.clone()));
                }
            }
        }
    }

    fn propagate_error(self: Rc<Self>, dm: &Multiplexer) {
        let reader = self.reader.borrow().clone();
        if let Some(reader) = reader {
            reader.io_failure(dm, self.hdl(), Operation::Read);
        }
        let writer = self.writer.borrow().clone();
        if let Some(writer) = writer {
            writer.io_failure(dm, self.hdl(), Operation::Write);
        }
        // the dispatcher deregisters both directions right after this call
    }
}

impl EventHandler for Stream {
    fn state(&self) -> &HandlerState {
        &self.state
    }

    fn handle_event(self: Rc<Self>, dm: &Multiplexer, op: Operation) {
        match op {
            Operation::Read => self.handle_read(dm),
            Operation::Write => self.handle_write(dm),
            Operation::PropagateError => self.propagate_error(dm),
        }
    }

    fn removed_from_loop(&self, op: Operation) {
        match op {
            Operation::Read => {
                self.reader.borrow_mut().take();
            }
            Operation::Write => {
                self.writer.borrow_mut().take();
            }
            Operation::PropagateError => {}
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        sys::close_socket(self.fd());
    }
}
