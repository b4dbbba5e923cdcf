//! `poll`-based readiness strategy. `poll` cannot carry a user pointer per
//! descriptor, so two vectors are kept aligned and sorted by descriptor:
//! `pollset` holds the kernel-facing entries, `shadow` the handlers, and a
//! binary search bridges between a reported descriptor and its handler.

use std::io;
use std::rc::Rc;

use log::error;

use crate::backend::{PendingEvent, Ready, RemovedFromLoop};
use crate::handler::{EventHandler, EventMask, Operation};
use crate::sys::NativeHandle;

pub(crate) const INPUT_MASK: EventMask = (libc::POLLIN | libc::POLLPRI) as EventMask;
pub(crate) const OUTPUT_MASK: EventMask = libc::POLLOUT as EventMask;
pub(crate) const ERROR_MASK: EventMask =
    (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) as EventMask;

pub(crate) struct ReadinessSet {
    pollset: Vec<libc::pollfd>,
    shadow: Vec<Rc<dyn EventHandler>>,
    pipe_rd: NativeHandle,
}

impl ReadinessSet {
    pub(crate) fn new(
        pipe_rd: NativeHandle,
        pipe_reader: Rc<dyn EventHandler>,
    ) -> io::Result<ReadinessSet> {
        pipe_reader.set_eventbf(INPUT_MASK);
        Ok(ReadinessSet {
            pollset: vec![libc::pollfd {
                fd: pipe_rd,
                events: INPUT_MASK as libc::c_short,
                revents: 0,
            }],
            shadow: vec![pipe_reader],
            pipe_rd,
        })
    }

    pub(crate) fn has_registered(&self) -> bool {
        !self.pollset.is_empty()
    }

    /// Classifies wait failures that only warrant another attempt. Memory
    /// pressure is retried in the hope someone else releases memory.
    pub(crate) fn retry(err: &io::Error) -> bool {
        matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::ENOMEM))
    }

    /// Blocks until the kernel reports readiness, then snapshots every
    /// entry with pending events together with its handler.
    pub(crate) fn wait(&mut self, out: &mut Vec<Ready>) -> io::Result<()> {
        debug_assert_eq!(self.pollset.len(), self.shadow.len());
        let presult = unsafe {
            libc::poll(self.pollset.as_mut_ptr(), self.pollset.len() as libc::nfds_t, -1)
        };
        if presult < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut pending = presult as usize;
        for (pfd, handler) in self.pollset.iter_mut().zip(&self.shadow) {
            if pending == 0 {
                break;
            }
            if pfd.revents != 0 {
                out.push(Ready {
                    fd: pfd.fd,
                    mask: pfd.revents as EventMask,
                    handler: Some(handler.clone()),
                });
                pfd.revents = 0;
                pending -= 1;
            }
        }
        Ok(())
    }

    /// Reconciles one queued registration change with the pollset.
    pub(crate) fn apply(&mut self, e: PendingEvent, removed: &mut Vec<RemovedFromLoop>) {
        debug_assert!(e.handler.is_some() || e.fd == self.pipe_rd);
        debug_assert_eq!(self.pollset.len(), self.shadow.len());
        let old = match &e.handler {
            Some(handler) => {
                let old = handler.eventbf();
                handler.set_eventbf(e.mask);
                old
            }
            None => 0,
        };
        match self.pollset.binary_search_by(|pfd| pfd.fd.cmp(&e.fd)) {
            Err(pos) => {
                if e.mask != 0 {
                    match e.handler {
                        Some(handler) => {
                            self.pollset.insert(
                                pos,
                                libc::pollfd {
                                    fd: e.fd,
                                    events: e.mask as libc::c_short,
                                    revents: 0,
                                },
                            );
                            self.shadow.insert(pos, handler);
                        }
                        None => error!("registration without handler for socket {}", e.fd),
                    }
                }
            }
            Ok(pos) => {
                if e.mask == 0 {
                    self.pollset.remove(pos);
                    self.shadow.remove(pos);
                } else {
                    self.pollset[pos].events = e.mask as libc::c_short;
                }
                if let Some(handler) = e.handler {
                    for (flag, op) in [(INPUT_MASK, Operation::Read), (OUTPUT_MASK, Operation::Write)]
                    {
                        if old & flag != 0 && e.mask & flag == 0 {
                            removed.push((handler.clone(), op));
                        }
                    }
                }
            }
        }
    }

    /// Every registered handler except the pipe reader.
    pub(crate) fn registered_handlers(&self) -> Vec<(NativeHandle, Rc<dyn EventHandler>)> {
        self.pollset
            .iter()
            .zip(&self.shadow)
            .filter(|(pfd, _)| pfd.fd != self.pipe_rd)
            .map(|(pfd, handler)| (pfd.fd, handler.clone()))
            .collect()
    }
}
