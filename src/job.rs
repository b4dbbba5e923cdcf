//! Schedulable units of work submitted to the loop thread.
//!
//! Jobs travel through the wake-up pipe as a single pointer-sized word.
//! Submitting a job transfers one strong reference into the pipe; reading a
//! frame transfers it back out. The reference is released when the job
//! reports [`ResumeResult::Done`] or when the pipe is torn down.

use std::sync::Arc;

use log::warn;

use crate::multiplexer::Multiplexer;

/// Outcome of one resume invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    /// The job made progress but has more to do; it is resubmitted.
    ResumeLater,
    /// The job is finished and its reference is released.
    Done,
    /// The job parked itself; whoever wakes it keeps it alive.
    Awaiting,
}

/// Routing class of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Actor bound to the I/O loop; runs on the loop thread.
    IoActor,
    /// Plain function object; runs on the loop thread.
    FunctionObject,
    /// Everything else; handed to the actor-system scheduler.
    Actor,
}

/// A unit of work that can be resumed on the loop thread.
pub trait Resumable: Send + Sync {
    fn subtype(&self) -> JobKind {
        JobKind::FunctionObject
    }

    fn resume(&self, dm: &Multiplexer, max_throughput: usize) -> ResumeResult;
}

/// Scheduler seam for jobs that do not belong on the I/O loop. The actor
/// system supplies the real implementation.
pub trait Scheduler: Send + Sync {
    fn enqueue(&self, job: Arc<dyn Resumable>);
}

/// Fallback scheduler installed when none is provided.
pub(crate) struct DiscardScheduler;

impl Scheduler for DiscardScheduler {
    fn enqueue(&self, _job: Arc<dyn Resumable>) {
        warn!("no scheduler installed, discarding job");
    }
}

struct FnJob<F>(F);

impl<F> Resumable for FnJob<F>
where
    F: Fn(&Multiplexer) + Send + Sync,
{
    fn resume(&self, dm: &Multiplexer, _max_throughput: usize) -> ResumeResult {
        (self.0)(dm);
        ResumeResult::Done
    }
}

/// Wraps a closure as a loop-thread job.
pub fn job<F>(f: F) -> Arc<dyn Resumable>
where
    F: Fn(&Multiplexer) + Send + Sync + 'static,
{
    Arc::new(FnJob(f))
}

/// Encodes a job as one pipe frame. The returned word owns the strong
/// reference that was passed in.
pub(crate) fn into_word(job: Arc<dyn Resumable>) -> usize {
    Box::into_raw(Box::new(job)) as usize
}

/// Decodes a pipe frame produced by [`into_word`], taking ownership of the
/// reference it carries.
///
/// # Safety
/// `word` must originate from [`into_word`] and must be decoded exactly
/// once.
pub(crate) unsafe fn from_word(word: usize) -> Arc<dyn Resumable> {
    *Box::from_raw(word as *mut Arc<dyn Resumable>)
}
