//! `epoll`-based readiness strategy. A shadow counter tracks the number of
//! registered descriptors so the loop can tell when nothing is left to
//! serve; a lookup table resolves reported descriptors back to their
//! handlers.

use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use log::{debug, error, trace};

use crate::backend::{PendingEvent, Ready, RemovedFromLoop};
use crate::handler::{EventHandler, EventMask, Operation};
use crate::sys::{self, NativeHandle};

pub(crate) const INPUT_MASK: EventMask = libc::EPOLLIN as EventMask;
pub(crate) const OUTPUT_MASK: EventMask = libc::EPOLLOUT as EventMask;
pub(crate) const ERROR_MASK: EventMask = (libc::EPOLLERR | libc::EPOLLHUP) as EventMask;

// events handled per kernel wait
const READY_SET_SIZE: usize = 64;

pub(crate) struct ReadinessSet {
    epfd: NativeHandle,
    ready: Vec<libc::epoll_event>,
    // number of descriptors currently registered with the kernel
    shadow: usize,
    handlers: HashMap<NativeHandle, Rc<dyn EventHandler>>,
    pipe_rd: NativeHandle,
}

impl ReadinessSet {
    pub(crate) fn new(
        pipe_rd: NativeHandle,
        pipe_reader: Rc<dyn EventHandler>,
    ) -> io::Result<ReadinessSet> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut ee = libc::epoll_event { events: INPUT_MASK as u32, u64: pipe_rd as u64 };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_rd, &mut ee) } < 0 {
            let err = io::Error::last_os_error();
            sys::close_socket(epfd);
            return Err(err);
        }
        pipe_reader.set_eventbf(INPUT_MASK);
        let mut handlers = HashMap::new();
        handlers.insert(pipe_rd, pipe_reader);
        Ok(ReadinessSet {
            epfd,
            ready: vec![libc::epoll_event { events: 0, u64: 0 }; READY_SET_SIZE],
            shadow: 1,
            handlers,
            pipe_rd,
        })
    }

    pub(crate) fn has_registered(&self) -> bool {
        self.shadow > 0
    }

    /// Classifies wait failures that only warrant another attempt.
    pub(crate) fn retry(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::EINTR)
    }

    /// Blocks until the kernel reports readiness, then snapshots every
    /// reported event together with its handler.
    pub(crate) fn wait(&mut self, out: &mut Vec<Ready>) -> io::Result<()> {
        let presult = unsafe {
            libc::epoll_wait(self.epfd, self.ready.as_mut_ptr(), self.ready.len() as libc::c_int, -1)
        };
        if presult < 0 {
            return Err(io::Error::last_os_error());
        }
        for ev in &self.ready[..presult as usize] {
            let fd = ev.u64 as NativeHandle;
            out.push(Ready {
                fd,
                mask: ev.events as EventMask,
                handler: self.handlers.get(&fd).cloned(),
            });
        }
        Ok(())
    }

    /// Reconciles one queued registration change with the kernel.
    pub(crate) fn apply(&mut self, e: PendingEvent, removed: &mut Vec<RemovedFromLoop>) {
        debug_assert!(e.handler.is_some() || e.fd == self.pipe_rd);
        let old = match &e.handler {
            Some(handler) => {
                let old = handler.eventbf();
                if old == e.mask {
                    return;
                }
                handler.set_eventbf(e.mask);
                old
            }
            // the pipe read end is only ever registered for input
            None => INPUT_MASK,
        };
        let ctl_op = if e.mask == 0 {
            debug!("removing socket {} from epoll", e.fd);
            self.shadow -= 1;
            self.handlers.remove(&e.fd);
            libc::EPOLL_CTL_DEL
        } else if old == 0 {
            debug!("adding socket {} to epoll", e.fd);
            self.shadow += 1;
            if let Some(handler) = &e.handler {
                self.handlers.insert(e.fd, handler.clone());
            }
            libc::EPOLL_CTL_ADD
        } else {
            trace!("changing epoll event mask for socket {}: {:#x} -> {:#x}", e.fd, old, e.mask);
            libc::EPOLL_CTL_MOD
        };
        let mut ee = libc::epoll_event { events: e.mask as u32, u64: e.fd as u64 };
        if unsafe { libc::epoll_ctl(self.epfd, ctl_op, e.fd, &mut ee) } < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EEXIST) => {
                    error!("socket {} registered twice", e.fd);
                    self.shadow -= 1;
                }
                Some(libc::ENOENT) => {
                    error!("cannot modify socket {} because it isn't registered", e.fd);
                    if e.mask == 0 {
                        self.shadow += 1;
                    }
                }
                _ => {
                    error!("epoll_ctl failed: {err}");
                    panic!("epoll_ctl() failed");
                }
            }
        }
        if let Some(handler) = e.handler {
            for (flag, op) in [(INPUT_MASK, Operation::Read), (OUTPUT_MASK, Operation::Write)] {
                if old & flag != 0 && e.mask & flag == 0 {
                    removed.push((handler.clone(), op));
                }
            }
        }
    }

    /// Every registered handler except the pipe reader.
    pub(crate) fn registered_handlers(&self) -> Vec<(NativeHandle, Rc<dyn EventHandler>)> {
        self.handlers
            .iter()
            .filter(|(fd, _)| **fd != self.pipe_rd)
            .map(|(fd, handler)| (*fd, handler.clone()))
            .collect()
    }
}

impl Drop for ReadinessSet {
    fn drop(&mut self) {
        sys::close_socket(self.epfd);
    }
}
