//! Reader side of the wake-up pipe. Each frame is a single pointer-sized
//! word transferring one job reference out of the pipe.

use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use crate::handler::{EventHandler, HandlerState, Operation};
use crate::job::{self, Resumable, ResumeResult};
use crate::multiplexer::Multiplexer;
use crate::sys::NativeHandle;

pub(crate) struct PipeReader {
    state: HandlerState,
}

impl PipeReader {
    /// Binds the reader to the read end of the wake-up pipe. The descriptor
    /// stays owned by the multiplexer; no socket options are touched since
    /// the pipe need not be a socket at all.
    pub(crate) fn new(fd: NativeHandle) -> PipeReader {
        PipeReader {
            state: HandlerState::new(fd),
        }
    }

    pub(crate) fn try_read_next(&self) -> Option<Arc<dyn Resumable>> {
        try_read_job(self.fd())
    }
}

/// One read of exactly one frame. Short reads (no data, or a torn frame)
/// yield `None`.
pub(crate) fn try_read_job(fd: NativeHandle) -> Option<Arc<dyn Resumable>> {
    let mut word = 0usize;
    let res = unsafe {
        libc::read(fd, &mut word as *mut usize as *mut libc::c_void, mem::size_of::<usize>())
    };
    if res != mem::size_of::<usize>() as isize {
        return None;
    }
    Some(unsafe { job::from_word(word) })
}

impl EventHandler for PipeReader {
    fn state(&self) -> &HandlerState {
        &self.state
    }

    fn handle_event(self: Rc<Self>, dm: &Multiplexer, op: Operation) {
        if let Operation::Read = op {
            if let Some(job) = self.try_read_next() {
                match job.resume(dm, dm.max_throughput()) {
                    ResumeResult::ResumeLater => dm.exec_later(job),
                    ResumeResult::Done => drop(job),
                    // an awaiting job is kept alive by whoever wakes it
                    ResumeResult::Awaiting => {}
                }
            }
        }
        // the pipe is never registered for output and errors on it surface
        // through the read path
    }

    fn removed_from_loop(&self, _op: Operation) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;

    #[test]
    fn should_read_one_frame_per_call() {
        let (rd, wr) = sys::create_pipe().unwrap();
        sys::nonblocking(rd, true).unwrap();

        let first = job::job(|_| {});
        let second = job::job(|_| {});
        let first_witness = Arc::downgrade(&first);
        let second_witness = Arc::downgrade(&second);

        for job in [first, second] {
            let word = job::into_word(job);
            let res = unsafe {
                libc::write(wr, &word as *const usize as *const libc::c_void, mem::size_of::<usize>())
            };
            assert_eq!(mem::size_of::<usize>() as isize, res);
        }

        let job = try_read_job(rd).expect("first frame missing");
        assert!(Arc::ptr_eq(&job, &first_witness.upgrade().unwrap()));
        drop(job);

        let job = try_read_job(rd).expect("second frame missing");
        drop(job);
        assert!(first_witness.upgrade().is_none());
        assert!(second_witness.upgrade().is_none());

        // drained pipe yields the empty sentinel
        assert!(try_read_job(rd).is_none());

        sys::close_socket(rd);
        sys::close_socket(wr);
    }
}
