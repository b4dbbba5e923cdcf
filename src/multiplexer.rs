//! The event loop: blocks on the OS readiness primitive, dispatches socket
//! events to their handlers, applies queued registration changes at the end
//! of every iteration and accepts cross-thread work through the wake-up
//! pipe.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, error};

use crate::acceptor::Acceptor;
use crate::backend::{
    PendingEvent, Ready, ReadinessSet, RemovedFromLoop, ERROR_MASK, INPUT_MASK, OUTPUT_MASK,
};
use crate::broker::{AcceptManager, StreamManager};
use crate::error::NetworkError;
use crate::handle::{AcceptHandle, ConnectionHandle};
use crate::handler::{add_flag, del_flag, EventHandler, EventMask, Operation};
use crate::job::{self, DiscardScheduler, JobKind, Resumable, ResumeResult, Scheduler};
use crate::pipe::{self, PipeReader};
use crate::resolve::Protocol;
use crate::stream::{ReceivePolicy, Stream};
use crate::sys::{self, NativeHandle, INVALID_NATIVE_HANDLE};

const DEFAULT_MAX_THROUGHPUT: usize = 300;

/// Single-threaded readiness-driven multiplexer. One instance owns one loop
/// thread; the only thread-safe entry points are [`Multiplexer::dispatcher`]
/// handles and the [`Supervisor`].
pub struct Multiplexer {
    backend: RefCell<ReadinessSet>,
    events: RefCell<Vec<PendingEvent>>,
    pipe: (NativeHandle, NativeHandle),
    scribes: RefCell<HashMap<ConnectionHandle, Rc<Stream>>>,
    doormen: RefCell<HashMap<AcceptHandle, Rc<Acceptor>>>,
    scheduler: RefCell<Arc<dyn Scheduler>>,
    max_throughput: Cell<usize>,
}

impl Multiplexer {
    pub fn new() -> io::Result<Multiplexer> {
        let (pipe_rd, pipe_wr) = sys::create_pipe()?;
        let pipe_reader: Rc<dyn EventHandler> = Rc::new(PipeReader::new(pipe_rd));
        let backend = match ReadinessSet::new(pipe_rd, pipe_reader) {
            Ok(backend) => backend,
            Err(err) => {
                sys::close_socket(pipe_rd);
                sys::close_socket(pipe_wr);
                return Err(err);
            }
        };
        Ok(Multiplexer {
            backend: RefCell::new(backend),
            events: RefCell::new(Vec::new()),
            pipe: (pipe_rd, pipe_wr),
            scribes: RefCell::new(HashMap::new()),
            doormen: RefCell::new(HashMap::new()),
            scheduler: RefCell::new(Arc::new(DiscardScheduler)),
            max_throughput: Cell::new(DEFAULT_MAX_THROUGHPUT),
        })
    }

    /// Installs the actor-system scheduler used for jobs that do not belong
    /// on the I/O loop.
    pub fn with_scheduler(self, scheduler: Arc<dyn Scheduler>) -> Multiplexer {
        *self.scheduler.borrow_mut() = scheduler;
        self
    }

    pub fn with_max_throughput(self, max_throughput: usize) -> Multiplexer {
        self.max_throughput.set(max_throughput);
        self
    }

    pub fn max_throughput(&self) -> usize {
        self.max_throughput.get()
    }

    /// Runs the loop until no handlers are registered. Each iteration blocks
    /// on the readiness primitive without a timeout, dispatches every
    /// reported event and only then applies the registration changes the
    /// callbacks queued up.
    pub fn run(&self) {
        let mut ready: Vec<Ready> = Vec::new();
        let mut removed: Vec<RemovedFromLoop> = Vec::new();
        while self.backend.borrow().has_registered() {
            if let Err(err) = self.backend.borrow_mut().wait(&mut ready) {
                if ReadinessSet::retry(&err) {
                    debug!("readiness wait interrupted: {err}, trying again");
                    ready.clear();
                    continue;
                }
                error!("readiness wait failed: {err}");
                panic!("readiness wait failed");
            }
            for ev in ready.drain(..) {
                match ev.handler {
                    Some(handler) => self.handle_socket_event(ev.fd, ev.mask, &handler),
                    None => debug!("dropping event for unknown socket {}", ev.fd),
                }
            }
            let queued = self.events.take();
            {
                let mut backend = self.backend.borrow_mut();
                for e in queued {
                    backend.apply(e, &mut removed);
                }
            }
            for (handler, op) in removed.drain(..) {
                handler.removed_from_loop(op);
            }
        }
    }

    /// Delivers one reported readiness event: read first (unless the read
    /// channel was shut down), then write; an error is only propagated when
    /// neither data direction fired, after which both directions are
    /// deregistered.
    fn handle_socket_event(&self, fd: NativeHandle, mask: EventMask, handler: &Rc<dyn EventHandler>) {
        let mut check_error = true;
        if mask & INPUT_MASK != 0 {
            check_error = false;
            if !handler.read_channel_closed() {
                handler.clone().handle_event(self, Operation::Read);
            }
        }
        if mask & OUTPUT_MASK != 0 {
            check_error = false;
            handler.clone().handle_event(self, Operation::Write);
        }
        if check_error && mask & ERROR_MASK != 0 {
            debug!("error event on socket {fd}");
            handler.clone().handle_event(self, Operation::PropagateError);
            self.del(Operation::Read, fd, Some(handler.clone()));
            self.del(Operation::Write, fd, Some(handler.clone()));
        }
    }

    pub(crate) fn add(&self, op: Operation, fd: NativeHandle, handler: Rc<dyn EventHandler>) {
        debug_assert!(fd != INVALID_NATIVE_HANDLE);
        self.new_event(add_flag, op, fd, Some(handler));
    }

    pub(crate) fn del(&self, op: Operation, fd: NativeHandle, handler: Option<Rc<dyn EventHandler>>) {
        debug_assert!(fd != INVALID_NATIVE_HANDLE);
        debug_assert!(handler.is_some() || fd == self.pipe.0);
        self.new_event(del_flag, op, fd, handler);
    }

    /// Queues a registration change, squashing it into an already queued
    /// change for the same descriptor. A change that restores the installed
    /// mask cancels out entirely.
    fn new_event(
        &self,
        flag: fn(Operation, EventMask) -> EventMask,
        op: Operation,
        fd: NativeHandle,
        handler: Option<Rc<dyn EventHandler>>,
    ) {
        let old_bf = handler.as_ref().map_or(INPUT_MASK, |h| h.eventbf());
        let mut queue = self.events.borrow_mut();
        if let Some(pos) = queue.iter().position(|e| e.fd == fd) {
            let merged = flag(op, queue[pos].mask);
            if merged == queue[pos].mask {
                // nothing changed
            } else if merged == old_bf {
                queue.remove(pos);
            } else {
                queue[pos].mask = merged;
            }
        } else {
            let mask = flag(op, old_bf);
            if mask != old_bf {
                queue.push(PendingEvent { fd, mask, handler });
            }
        }
    }

    /// Thread-safe submission of a job. I/O-bound kinds are routed to the
    /// loop thread through the wake-up pipe, everything else goes to the
    /// scheduler. Takes one reference.
    pub fn exec_later(&self, job: Arc<dyn Resumable>) {
        match job.subtype() {
            JobKind::IoActor | JobKind::FunctionObject => wr_dispatch_request(self.pipe.1, job),
            JobKind::Actor => self.scheduler.borrow().enqueue(job),
        }
    }

    /// Runs a closure on the loop thread.
    pub fn dispatch<F>(&self, f: F)
    where
        F: Fn(&Multiplexer) + Send + Sync + 'static,
    {
        self.exec_later(job::job(f));
    }

    /// Returns a cloneable cross-thread handle for submitting jobs.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            pipe_wr: self.pipe.1,
            scheduler: self.scheduler.borrow().clone(),
        }
    }

    /// Returns a scoped token whose destruction shuts the loop down: the
    /// wake-up pipe is deregistered along with every remaining handler,
    /// which lets [`Multiplexer::run`] return.
    pub fn make_supervisor(&self) -> Supervisor {
        Supervisor {
            dispatcher: self.dispatcher(),
        }
    }

    fn close_pipe(&self) {
        debug!("shutting the loop down");
        for (fd, handler) in self.backend.borrow().registered_handlers() {
            self.del(Operation::Read, fd, Some(handler.clone()));
            self.del(Operation::Write, fd, Some(handler));
        }
        self.del(Operation::Read, self.pipe.0, None);
    }

    /// Adopts a connected socket as a scribe under `mgr`. The stream is
    /// launched by the first [`Multiplexer::configure_read`] call.
    pub fn add_tcp_scribe_from(
        &self,
        mgr: Rc<dyn StreamManager>,
        fd: NativeHandle,
    ) -> io::Result<ConnectionHandle> {
        let stream = Rc::new(Stream::new(fd)?);
        stream.set_manager(mgr);
        let hdl = stream.hdl();
        self.scribes.borrow_mut().insert(hdl, stream);
        Ok(hdl)
    }

    /// Resolves `host`, connects and adopts the connection as a scribe.
    pub fn add_tcp_scribe(
        &self,
        mgr: Rc<dyn StreamManager>,
        host: &str,
        port: u16,
    ) -> Result<ConnectionHandle, NetworkError> {
        let fd = sys::new_tcp_connection(host, port, None)?;
        Ok(self.add_tcp_scribe_from(mgr, fd)?)
    }

    /// Resolves `host` and connects without adopting; the returned handle
    /// can be adopted later via [`Multiplexer::assign_tcp_scribe`].
    pub fn new_tcp_scribe(&self, host: &str, port: u16) -> Result<ConnectionHandle, NetworkError> {
        let fd = sys::new_tcp_connection(host, port, None)?;
        Ok(ConnectionHandle::from_socket(fd))
    }

    /// Adopts a connection previously returned by
    /// [`Multiplexer::new_tcp_scribe`].
    pub fn assign_tcp_scribe(
        &self,
        mgr: Rc<dyn StreamManager>,
        hdl: ConnectionHandle,
    ) -> io::Result<ConnectionHandle> {
        self.add_tcp_scribe_from(mgr, hdl.socket())
    }

    /// Adopts a listening socket as a doorman under `mgr` and registers it
    /// for accepting.
    pub fn add_tcp_doorman_from(
        &self,
        mgr: Rc<dyn AcceptManager>,
        fd: NativeHandle,
    ) -> io::Result<AcceptHandle> {
        let acceptor = Rc::new(Acceptor::new(fd)?);
        let hdl = acceptor.hdl();
        self.doormen.borrow_mut().insert(hdl, acceptor.clone());
        acceptor.start(self, mgr);
        Ok(hdl)
    }

    /// Binds and listens, then adopts the passive socket. Returns the handle
    /// together with the actually bound port.
    pub fn add_tcp_doorman(
        &self,
        mgr: Rc<dyn AcceptManager>,
        port: u16,
        host: Option<&str>,
        reuse_addr: bool,
    ) -> Result<(AcceptHandle, u16), NetworkError> {
        let (fd, bound_port) = sys::new_tcp_acceptor_impl(port, host, reuse_addr)?;
        Ok((self.add_tcp_doorman_from(mgr, fd)?, bound_port))
    }

    /// Binds and listens without adopting; the returned handle can be
    /// adopted later via [`Multiplexer::assign_tcp_doorman`].
    pub fn new_tcp_doorman(
        &self,
        port: u16,
        host: Option<&str>,
        reuse_addr: bool,
    ) -> Result<(AcceptHandle, u16), NetworkError> {
        let (fd, bound_port) = sys::new_tcp_acceptor_impl(port, host, reuse_addr)?;
        Ok((AcceptHandle::from_socket(fd), bound_port))
    }

    /// Adopts an acceptor previously returned by
    /// [`Multiplexer::new_tcp_doorman`].
    pub fn assign_tcp_doorman(
        &self,
        mgr: Rc<dyn AcceptManager>,
        hdl: AcceptHandle,
    ) -> io::Result<AcceptHandle> {
        self.add_tcp_doorman_from(mgr, hdl.socket())
    }

    /// Moves the accepted socket out of the doorman's latch. Present only
    /// between an accept and the end of the `new_connection` callback it
    /// triggered.
    pub fn accepted_socket(&self, hdl: AcceptHandle) -> Option<NativeHandle> {
        self.doormen.borrow().get(&hdl).and_then(|acceptor| acceptor.accepted_socket())
    }

    /// Sets the receive policy of an adopted stream. The first call launches
    /// the stream; later calls retune it, effective at the next read cycle.
    pub fn configure_read(&self, hdl: ConnectionHandle, policy: ReceivePolicy) -> io::Result<()> {
        let stream = self.scribe(hdl)?;
        stream.configure_read(policy);
        if !stream.launched() {
            stream.clone().launch(self);
        }
        Ok(())
    }

    /// Enables or disables write acknowledgements for an adopted stream.
    pub fn ack_writes(&self, hdl: ConnectionHandle, enable: bool) -> io::Result<()> {
        self.scribe(hdl)?.set_ack_writes(enable);
        Ok(())
    }

    /// Appends bytes to the stream's offline write buffer. No syscall is
    /// made until [`Multiplexer::flush`].
    pub fn write(&self, hdl: ConnectionHandle, buf: &[u8]) -> io::Result<()> {
        self.scribe(hdl)?.write(buf);
        Ok(())
    }

    /// Starts draining buffered writes. A no-op while a previous flush is
    /// still in flight or when nothing is buffered.
    pub fn flush(&self, hdl: ConnectionHandle) -> io::Result<()> {
        let stream = self.scribe(hdl)?;
        let mgr = stream.manager().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "scribe has no manager")
        })?;
        stream.flush(self, mgr);
        Ok(())
    }

    /// Shuts the stream's read channel down and deregisters it. The handle
    /// is forgotten; buffered writes already in flight still drain.
    pub fn stop_reading(&self, hdl: ConnectionHandle) -> io::Result<()> {
        let stream = self.scribe(hdl)?;
        self.scribes.borrow_mut().remove(&hdl);
        stream.stop_reading(self);
        Ok(())
    }

    /// Stops accepting on a doorman and forgets its handle.
    pub fn stop_listening(&self, hdl: AcceptHandle) -> io::Result<()> {
        let acceptor = self
            .doormen
            .borrow_mut()
            .remove(&hdl)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown accept handle"))?;
        acceptor.stop_reading(self);
        Ok(())
    }

    /// Peer address of an adopted connection.
    pub fn remote_addr(&self, hdl: ConnectionHandle) -> io::Result<std::net::SocketAddr> {
        sys::remote_addr_of(self.scribe(hdl)?.fd())
    }

    /// Bound address of an adopted doorman.
    pub fn local_addr(&self, hdl: AcceptHandle) -> io::Result<std::net::SocketAddr> {
        let doormen = self.doormen.borrow();
        let acceptor = doormen
            .get(&hdl)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown accept handle"))?;
        sys::local_addr_of(acceptor.fd())
    }

    fn scribe(&self, hdl: ConnectionHandle) -> io::Result<Rc<Stream>> {
        self.scribes
            .borrow()
            .get(&hdl)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown connection handle"))
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        // close the write end first so no further frames can arrive, then
        // flush the pipe, releasing one job reference per frame
        sys::close_socket(self.pipe.1);
        if sys::nonblocking(self.pipe.0, true).is_ok() {
            while let Some(job) = pipe::try_read_job(self.pipe.0) {
                drop(job);
            }
        }
        sys::close_socket(self.pipe.0);
    }
}

/// Writes one job frame to the pipe. A closed pipe discards the job and its
/// reference; a partial write means the frame stream is corrupt and is
/// fatal.
fn wr_dispatch_request(pipe_wr: NativeHandle, job: Arc<dyn Resumable>) {
    let word = job::into_word(job);
    let res = unsafe {
        libc::write(pipe_wr, &word as *const usize as *const libc::c_void, mem::size_of::<usize>())
    };
    if res <= 0 {
        drop(unsafe { job::from_word(word) });
    } else if (res as usize) < mem::size_of::<usize>() {
        error!("wrote partial frame to dispatch pipe");
        panic!("wrote partial frame to dispatch pipe");
    }
}

/// Cloneable cross-thread entry point for submitting jobs to a multiplexer.
#[derive(Clone)]
pub struct Dispatcher {
    pipe_wr: NativeHandle,
    scheduler: Arc<dyn Scheduler>,
}

impl Dispatcher {
    /// Thread-safe submission of a job; see [`Multiplexer::exec_later`].
    pub fn exec_later(&self, job: Arc<dyn Resumable>) {
        match job.subtype() {
            JobKind::IoActor | JobKind::FunctionObject => wr_dispatch_request(self.pipe_wr, job),
            JobKind::Actor => self.scheduler.enqueue(job),
        }
    }

    /// Runs a closure on the loop thread.
    pub fn dispatch<F>(&self, f: F)
    where
        F: Fn(&Multiplexer) + Send + Sync + 'static,
    {
        self.exec_later(job::job(f));
    }
}

/// Scoped shutdown token. Dropping it posts the close action to the loop,
/// which deregisters the wake-up pipe and every remaining handler and so
/// lets [`Multiplexer::run`] return.
pub struct Supervisor {
    dispatcher: Dispatcher,
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.dispatcher.exec_later(Arc::new(ClosePipe));
    }
}

struct ClosePipe;

impl Resumable for ClosePipe {
    fn resume(&self, dm: &Multiplexer, _max_throughput: usize) -> ResumeResult {
        dm.close_pipe();
        ResumeResult::Done
    }
}

/// Opens a TCP connection with an optional family preference; a failing
/// IPv6 attempt falls back to IPv4 once.
pub fn new_tcp_connection(
    host: &str,
    port: u16,
    preferred: Option<Protocol>,
) -> Result<ConnectionHandle, NetworkError> {
    Ok(ConnectionHandle::from_socket(sys::new_tcp_connection(host, port, preferred)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerState;
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Weak as SyncWeak};
    use std::thread;
    use std::time::Duration;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    struct NullHandler {
        state: HandlerState,
    }

    impl NullHandler {
        fn new(fd: NativeHandle) -> Rc<NullHandler> {
            Rc::new(NullHandler {
                state: HandlerState::new(fd),
            })
        }
    }

    impl EventHandler for NullHandler {
        fn state(&self) -> &HandlerState {
            &self.state
        }

        fn handle_event(self: Rc<Self>, _dm: &Multiplexer, _op: Operation) {}

        fn removed_from_loop(&self, _op: Operation) {}
    }

    #[test]
    fn should_squash_repeated_registrations_into_one_event() {
        let dm = Multiplexer::new().unwrap();
        let handler = NullHandler::new(99);

        dm.add(Operation::Read, 99, handler.clone());
        dm.add(Operation::Read, 99, handler.clone());
        assert_eq!(1, dm.events.borrow().len());
        assert_eq!(INPUT_MASK, dm.events.borrow()[0].mask);

        dm.add(Operation::Write, 99, handler.clone());
        assert_eq!(1, dm.events.borrow().len());
        assert_eq!(INPUT_MASK | OUTPUT_MASK, dm.events.borrow()[0].mask);
    }

    #[test]
    fn should_cancel_out_add_followed_by_del() {
        let dm = Multiplexer::new().unwrap();
        let handler = NullHandler::new(99);

        dm.add(Operation::Read, 99, handler.clone());
        dm.del(Operation::Read, 99, Some(handler.clone()));
        assert!(dm.events.borrow().is_empty());

        // deleting interest that was never installed queues nothing
        dm.del(Operation::Write, 99, Some(handler.clone()));
        assert!(dm.events.borrow().is_empty());
    }

    #[test]
    fn should_skip_no_op_registration_for_installed_mask() {
        let dm = Multiplexer::new().unwrap();
        let handler = NullHandler::new(99);
        handler.set_eventbf(INPUT_MASK);

        dm.add(Operation::Read, 99, handler.clone());
        assert!(dm.events.borrow().is_empty());

        dm.del(Operation::Read, 99, Some(handler.clone()));
        dm.add(Operation::Read, 99, handler.clone());
        assert!(dm.events.borrow().is_empty());
    }

    // loop harness ---------------------------------------------------------

    #[derive(Debug, PartialEq, Eq)]
    enum TestEvent {
        Accepted,
        Consumed(Vec<u8>),
        Transferred { written: usize, remaining: usize },
        ReadFailed,
        WriteFailed,
    }

    #[derive(Clone)]
    struct Behaviour {
        policy: ReceivePolicy,
        ack_writes: bool,
        reply: Option<&'static [u8]>,
        greeting: &'static [&'static [u8]],
        rewrite_on_read_failure: bool,
    }

    impl Default for Behaviour {
        fn default() -> Self {
            Behaviour {
                policy: ReceivePolicy::AtMost(1024),
                ack_writes: false,
                reply: None,
                greeting: &[],
                rewrite_on_read_failure: false,
            }
        }
    }

    struct TestDoorman {
        tx: mpsc::Sender<TestEvent>,
        behaviour: Behaviour,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for TestDoorman {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl AcceptManager for TestDoorman {
        fn new_connection(&self, dm: &Multiplexer, hdl: AcceptHandle) {
            let _ = self.tx.send(TestEvent::Accepted);
            let sock = dm.accepted_socket(hdl).expect("no accepted socket latched");
            let scribe = Rc::new(TestScribe {
                tx: self.tx.clone(),
                behaviour: self.behaviour.clone(),
                rewrites: Cell::new(0),
            });
            let conn = dm.add_tcp_scribe_from(scribe, sock).expect("unable to adopt connection");
            if self.behaviour.ack_writes {
                dm.ack_writes(conn, true).unwrap();
            }
            dm.configure_read(conn, self.behaviour.policy).unwrap();
            for chunk in self.behaviour.greeting {
                dm.write(conn, chunk).unwrap();
            }
            if !self.behaviour.greeting.is_empty() {
                dm.flush(conn).unwrap();
            }
        }
    }

    struct TestScribe {
        tx: mpsc::Sender<TestEvent>,
        behaviour: Behaviour,
        rewrites: Cell<u32>,
    }

    impl StreamManager for TestScribe {
        fn consume(&self, dm: &Multiplexer, hdl: ConnectionHandle, data: &[u8]) {
            let _ = self.tx.send(TestEvent::Consumed(data.to_vec()));
            if let Some(reply) = self.behaviour.reply {
                dm.write(hdl, reply).unwrap();
                dm.flush(hdl).unwrap();
            }
        }

        fn data_transferred(
            &self,
            dm: &Multiplexer,
            hdl: ConnectionHandle,
            written: usize,
            remaining: usize,
        ) {
            let _ = self.tx.send(TestEvent::Transferred { written, remaining });
            let rewrites = self.rewrites.get();
            if rewrites > 0 && rewrites < 64 {
                self.rewrites.set(rewrites + 1);
                dm.write(hdl, b"x").unwrap();
                dm.flush(hdl).unwrap();
            }
        }

        fn io_failure(&self, dm: &Multiplexer, hdl: ConnectionHandle, op: Operation) {
            match op {
                Operation::Read => {
                    let _ = self.tx.send(TestEvent::ReadFailed);
                    if self.behaviour.rewrite_on_read_failure {
                        self.rewrites.set(1);
                        dm.write(hdl, b"x").unwrap();
                        dm.flush(hdl).unwrap();
                    }
                }
                Operation::Write => {
                    let _ = self.tx.send(TestEvent::WriteFailed);
                }
                Operation::PropagateError => {}
            }
        }
    }

    struct Harness {
        port: u16,
        events: mpsc::Receiver<TestEvent>,
        supervisor: Option<Supervisor>,
        doorman_dropped: Arc<AtomicBool>,
        loop_thread: Option<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn start(behaviour: Behaviour) -> Harness {
            let (event_tx, event_rx) = mpsc::channel();
            let (setup_tx, setup_rx) = mpsc::channel();
            let doorman_dropped = Arc::new(AtomicBool::new(false));
            let dropped = doorman_dropped.clone();
            let loop_thread = thread::spawn(move || {
                let dm = Multiplexer::new().expect("unable to create multiplexer");
                let doorman = Rc::new(TestDoorman {
                    tx: event_tx,
                    behaviour,
                    dropped,
                });
                let (_, port) = dm
                    .add_tcp_doorman(doorman, 0, Some("127.0.0.1"), false)
                    .expect("unable to open doorman");
                setup_tx.send((port, dm.make_supervisor())).unwrap();
                dm.run();
            });
            let (port, supervisor) = setup_rx.recv().expect("loop thread died during setup");
            Harness {
                port,
                events: event_rx,
                supervisor: Some(supervisor),
                doorman_dropped,
                loop_thread: Some(loop_thread),
            }
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("unable to connect");
            stream.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();
            stream
        }

        fn expect_event(&self) -> TestEvent {
            self.events.recv_timeout(EVENT_TIMEOUT).expect("timed out waiting for event")
        }

        fn shutdown(&mut self) -> Vec<TestEvent> {
            drop(self.supervisor.take());
            self.loop_thread.take().unwrap().join().expect("loop thread panicked");
            self.events.try_iter().collect()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            drop(self.supervisor.take());
            if let Some(loop_thread) = self.loop_thread.take() {
                let _ = loop_thread.join();
            }
        }
    }

    #[test]
    fn should_echo_through_adopted_scribe() {
        let mut harness = Harness::start(Behaviour {
            reply: Some(b"pong"),
            ..Behaviour::default()
        });

        let mut client = harness.connect();
        client.write_all(b"ping").unwrap();

        assert_eq!(TestEvent::Accepted, harness.expect_event());
        assert_eq!(TestEvent::Consumed(b"ping".to_vec()), harness.expect_event());

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(b"pong", &buf);

        harness.shutdown();
    }

    #[test]
    fn should_deliver_exactly_sized_frames() {
        let mut harness = Harness::start(Behaviour {
            policy: ReceivePolicy::Exactly(8),
            ..Behaviour::default()
        });

        let mut client = harness.connect();
        client.write_all(b"abcd").unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"efgh").unwrap();

        assert_eq!(TestEvent::Accepted, harness.expect_event());
        assert_eq!(TestEvent::Consumed(b"abcdefgh".to_vec()), harness.expect_event());

        let leftovers = harness.shutdown();
        assert!(
            !leftovers.iter().any(|e| matches!(e, TestEvent::Consumed(_))),
            "expected a single delivery, got extra: {leftovers:?}"
        );
    }

    #[test]
    fn should_acknowledge_writes_in_call_order() {
        let mut harness = Harness::start(Behaviour {
            ack_writes: true,
            greeting: &[b"0123456789" as &[u8], b"abcdef"],
            ..Behaviour::default()
        });

        let mut client = harness.connect();
        assert_eq!(TestEvent::Accepted, harness.expect_event());

        // both buffered writes drain as one contiguous byte sequence
        let mut buf = [0u8; 16];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(b"0123456789abcdef", &buf);

        let mut written_total = 0;
        let mut last_remaining = usize::MAX;
        while written_total < 16 {
            match harness.expect_event() {
                TestEvent::Transferred { written, remaining } => {
                    written_total += written;
                    last_remaining = remaining;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(16, written_total);
        assert_eq!(0, last_remaining);

        harness.shutdown();
    }

    #[test]
    fn should_report_orderly_close_and_late_write_failure() {
        let mut harness = Harness::start(Behaviour {
            ack_writes: true,
            rewrite_on_read_failure: true,
            ..Behaviour::default()
        });

        let client = harness.connect();
        assert_eq!(TestEvent::Accepted, harness.expect_event());
        drop(client);

        assert_eq!(TestEvent::ReadFailed, harness.expect_event());
        // flushes keep succeeding until the peer reset surfaces
        loop {
            match harness.expect_event() {
                TestEvent::WriteFailed => break,
                TestEvent::Transferred { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }

        harness.shutdown();
    }

    #[test]
    fn should_notify_removed_from_loop_on_shutdown() {
        let mut harness = Harness::start(Behaviour::default());
        assert!(!harness.doorman_dropped.load(Ordering::SeqCst));

        harness.shutdown();
        // dropping the accept manager is driven by removed_from_loop(read)
        assert!(harness.doorman_dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn should_resume_jobs_submitted_from_other_threads() {
        let (setup_tx, setup_rx) = mpsc::channel();
        let loop_thread = thread::spawn(move || {
            let dm = Multiplexer::new().expect("unable to create multiplexer");
            setup_tx.send((dm.dispatcher(), dm.make_supervisor())).unwrap();
            dm.run();
        });
        let (dispatcher, supervisor) = setup_rx.recv().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    let mut witnesses: Vec<SyncWeak<dyn Resumable>> = Vec::with_capacity(1000);
                    for _ in 0..1000 {
                        let counter = counter.clone();
                        let job = job::job(move |_| {
                            counter.fetch_add(1, Ordering::SeqCst);
                        });
                        witnesses.push(Arc::downgrade(&job));
                        dispatcher.exec_later(job);
                    }
                    witnesses
                })
            })
            .collect();

        let mut witnesses = Vec::with_capacity(4000);
        for producer in producers {
            witnesses.extend(producer.join().unwrap());
        }

        // the close action is queued behind all submitted jobs
        drop(supervisor);
        loop_thread.join().expect("loop thread panicked");

        assert_eq!(4000, counter.load(Ordering::SeqCst));
        assert!(witnesses.iter().all(|w| w.upgrade().is_none()));
    }

    #[test]
    fn should_resubmit_jobs_that_resume_later() {
        struct CountDown {
            left: AtomicUsize,
            resumes: AtomicUsize,
        }

        impl Resumable for CountDown {
            fn resume(&self, _dm: &Multiplexer, _max_throughput: usize) -> ResumeResult {
                self.resumes.fetch_add(1, Ordering::SeqCst);
                if self.left.fetch_sub(1, Ordering::SeqCst) > 1 {
                    ResumeResult::ResumeLater
                } else {
                    ResumeResult::Done
                }
            }
        }

        let (setup_tx, setup_rx) = mpsc::channel();
        let loop_thread = thread::spawn(move || {
            let dm = Multiplexer::new().expect("unable to create multiplexer");
            setup_tx.send((dm.dispatcher(), dm.make_supervisor())).unwrap();
            dm.run();
        });
        let (dispatcher, supervisor) = setup_rx.recv().unwrap();

        let job = Arc::new(CountDown {
            left: AtomicUsize::new(3),
            resumes: AtomicUsize::new(0),
        });
        dispatcher.exec_later(job.clone());

        // wait until the job has drained itself, then shut down
        while job.resumes.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(10));
        }
        drop(supervisor);
        loop_thread.join().unwrap();

        assert_eq!(3, job.resumes.load(Ordering::SeqCst));
        assert_eq!(1, Arc::strong_count(&job));
    }
}
