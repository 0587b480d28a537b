//! Slab-backed submission/completion pump for `io_uring`.
//!
//! [`Ring`] owns an [`IoUring`] instance, the state of every in-flight
//! operation, and a caller-supplied context. Operations implement [`RingOp`]:
//! they build their submission entry once and are called back with the
//! completion result, from where they can mutate the context and queue
//! follow-up operations through the [`Completion`] handle.
//!
//! The in-flight table is a [`Slab`] and the slab key doubles as the SQE
//! `user_data`, so a completion maps back to its operation without any
//! pointer round-trips. Operations queued while the submission queue is full
//! are buffered and flushed as slots free up; nothing is lost under burst.

use {
    io_uring::{cqueue, squeue, types, IoUring},
    log::warn,
    slab::Slab,
    std::{collections::VecDeque, io, time::Duration},
};

/// Submission queue slots kept free while queuing entries.
///
/// Completion handlers produce follow-up operations; the headroom lets a
/// batch of completions stage its successors before the next submit syscall.
pub const SQ_HEADROOM: usize = 16;

/// Cap on the number of waits [`Ring::drain`] performs before giving up.
const DRAIN_WAIT_LIMIT: u32 = 1024;
const DRAIN_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// A single asynchronous operation driven through the ring.
///
/// `C` is the context shared by all operations of one ring.
pub trait RingOp<C>: Sized {
    /// Build the submission entry for this operation.
    ///
    /// Any pointer stored in the entry must reference heap memory owned by
    /// the operation (boxed buffers, `CString`s, `Arc` interiors) and never
    /// the operation's inline fields: the in-flight table may move
    /// operations when it grows, while their heap allocations stay put.
    fn entry(&mut self) -> squeue::Entry;

    /// Handle the completion result.
    ///
    /// For multishot operations this is invoked once per completion;
    /// [`Completion::more`] tells whether the submission remains armed.
    /// Returning an error aborts completion processing, so recoverable
    /// conditions should be handled here rather than propagated.
    fn complete(
        &mut self,
        completion: &mut Completion<'_, C, Self>,
        res: io::Result<i32>,
    ) -> io::Result<()>;
}

/// Handle passed to [`RingOp::complete`].
///
/// Grants access to the ring context and lets the handler queue follow-up
/// operations without touching the ring itself.
pub struct Completion<'a, C, O> {
    context: &'a mut C,
    queued: &'a mut VecDeque<O>,
    more: bool,
}

impl<C, O> Completion<'_, C, O> {
    pub fn context(&self) -> &C {
        self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        self.context
    }

    /// Queue a follow-up operation.
    ///
    /// The operation is staged in the submission queue as soon as there is
    /// room and submitted together with the rest of the batch.
    pub fn push(&mut self, op: O) {
        self.queued.push_back(op);
    }

    /// Whether the completed submission is multishot and remains armed.
    pub fn more(&self) -> bool {
        self.more
    }
}

/// An `io_uring` instance together with its in-flight operations and context.
pub struct Ring<C, O: RingOp<C>> {
    ring: IoUring,
    ops: Slab<O>,
    queued: VecDeque<O>,
    context: C,
}

impl<C, O: RingOp<C>> Ring<C, O> {
    pub fn new(ring: IoUring, context: C) -> Self {
        let depth = ring.params().cq_entries() as usize;
        Self {
            ring,
            ops: Slab::with_capacity(depth),
            queued: VecDeque::new(),
            context,
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Number of operations submitted (or staged) and not yet retired.
    pub fn in_flight(&self) -> usize {
        self.ops.len() + self.queued.len()
    }

    pub fn is_idle(&self) -> bool {
        self.ops.is_empty() && self.queued.is_empty()
    }

    /// Queue `op` for submission.
    ///
    /// The entry is staged immediately if the submission queue has room;
    /// the actual submit syscall is deferred to the next [`Ring::submit`] or
    /// wait call so bursts coalesce into one enter.
    pub fn push(&mut self, op: O) -> io::Result<()> {
        self.queued.push_back(op);
        self.flush_queued()
    }

    /// Submit all staged entries without waiting for completions.
    pub fn submit(&mut self) -> io::Result<()> {
        self.flush_queued()?;
        self.submit_ring().map(|_| ())
    }

    /// Submit staged entries and wait for at least `want` completions, or
    /// until `timeout` elapses. Timeouts and interrupts return quietly so
    /// the caller can poll its shutdown condition.
    pub fn submit_and_wait(&mut self, want: usize, timeout: Option<Duration>) -> io::Result<()> {
        self.flush_queued()?;
        let res = match timeout {
            Some(timeout) => {
                let ts = types::Timespec::new()
                    .sec(timeout.as_secs())
                    .nsec(timeout.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(want, &args)
            }
            None => self.ring.submit_and_wait(want),
        };
        match res {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ETIME | libc::EINTR | libc::EBUSY)
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Dispatch every completion currently visible in the completion queue.
    ///
    /// Entries are consumed one at a time, re-syncing the queue view between
    /// them, so completions that land while handlers run are picked up in
    /// the same pass. Follow-up operations queued by handlers are staged
    /// after each dispatch and ride the next submit syscall.
    pub fn process_completions(&mut self) -> io::Result<usize> {
        let mut handled = 0;
        loop {
            let next = {
                let mut completion_queue = self.ring.completion();
                completion_queue.sync();
                completion_queue.next()
            };
            let Some(cqe) = next else { break };

            let key = cqe.user_data() as usize;
            let more = cqueue::more(cqe.flags());
            let res = cqe_result(cqe.result());

            let Self {
                ops,
                queued,
                context,
                ..
            } = self;
            let mut completion = Completion {
                context,
                queued,
                more,
            };
            if more {
                match ops.get_mut(key) {
                    Some(op) => op.complete(&mut completion, res)?,
                    None => warn!("completion for unknown in-flight key {key}"),
                }
            } else if ops.contains(key) {
                let mut op = ops.remove(key);
                op.complete(&mut completion, res)?;
            } else {
                warn!("completion for unknown in-flight key {key}");
            }
            handled += 1;

            self.flush_queued()?;
        }
        Ok(handled)
    }

    /// Synchronously cancel every in-flight operation.
    ///
    /// The cancelled operations complete with `ECANCELED` and are retired by
    /// a subsequent [`Ring::drain`].
    pub fn cancel_all(&mut self) -> io::Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        match self
            .ring
            .submitter()
            .register_sync_cancel(None, types::CancelBuilder::any())
        {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Process completions until no operation is in flight.
    pub fn drain(&mut self) -> io::Result<()> {
        let mut waits = 0;
        while !self.is_idle() {
            self.process_completions()?;
            if self.is_idle() {
                break;
            }
            if waits >= DRAIN_WAIT_LIMIT {
                warn!(
                    "giving up on drain with {} operations still in flight",
                    self.in_flight()
                );
                break;
            }
            waits += 1;
            self.submit_and_wait(1, Some(DRAIN_WAIT_TIMEOUT))?;
        }
        Ok(())
    }

    fn flush_queued(&mut self) -> io::Result<()> {
        // Clamped so that tiny rings still make progress.
        let headroom = SQ_HEADROOM.min(self.sq_capacity() / 2);
        while !self.queued.is_empty() {
            if self.sq_space_left() <= headroom {
                self.submit_ring()?;
                if self.sq_space_left() == 0 {
                    break;
                }
            }
            let op = self.queued.pop_front().expect("queue checked non-empty");
            let key = self.ops.insert(op);
            let entry = self.ops[key].entry().user_data(key as u64);
            // Safety: the RingOp contract requires entry pointers to
            // reference op-owned heap memory that lives until completion.
            let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
            if !pushed {
                let op = self.ops.remove(key);
                self.queued.push_front(op);
                break;
            }
        }
        Ok(())
    }

    fn sq_space_left(&mut self) -> usize {
        let mut submission_queue = self.ring.submission();
        submission_queue.sync();
        submission_queue.capacity() - submission_queue.len()
    }

    fn sq_capacity(&mut self) -> usize {
        self.ring.submission().capacity()
    }

    fn submit_ring(&mut self) -> io::Result<usize> {
        match self.ring.submit() {
            Ok(submitted) => Ok(submitted),
            Err(err) if matches!(err.raw_os_error(), Some(libc::EBUSY | libc::EINTR)) => Ok(0),
            Err(err) => Err(err),
        }
    }
}

impl<C, O: RingOp<C>> Drop for Ring<C, O> {
    fn drop(&mut self) {
        // The kernel may still hold pointers into op-owned buffers; retire
        // everything before those allocations are freed.
        if !self.ops.is_empty() {
            let _ = self.cancel_all();
            let _ = self.drain();
        }
    }
}

fn cqe_result(res: i32) -> io::Result<i32> {
    if res < 0 {
        Err(io::Error::from_raw_os_error(-res))
    } else {
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, io_uring::opcode};

    #[derive(Default)]
    struct Counter {
        completed: usize,
    }

    enum TestOp {
        Nop,
        /// Queues another chained op from its completion until the count
        /// reaches zero.
        Chain(u32),
    }

    impl RingOp<Counter> for TestOp {
        fn entry(&mut self) -> squeue::Entry {
            opcode::Nop::new().build()
        }

        fn complete(
            &mut self,
            completion: &mut Completion<'_, Counter, Self>,
            res: io::Result<i32>,
        ) -> io::Result<()> {
            res?;
            completion.context_mut().completed += 1;
            if let TestOp::Chain(left) = self {
                if *left > 0 {
                    completion.push(TestOp::Chain(*left - 1));
                }
            }
            Ok(())
        }
    }

    fn run_until_idle(ring: &mut Ring<Counter, TestOp>) {
        while !ring.is_idle() {
            ring.submit_and_wait(1, Some(Duration::from_secs(5))).unwrap();
            ring.process_completions().unwrap();
        }
    }

    fn test_ring(depth: u32) -> Ring<Counter, TestOp> {
        let io_uring = IoUring::new(depth).unwrap();
        Ring::new(io_uring, Counter::default())
    }

    #[test]
    fn test_completes_all_ops() {
        let mut ring = test_ring(8);
        for _ in 0..4 {
            ring.push(TestOp::Nop).unwrap();
        }
        assert_eq!(ring.in_flight(), 4);
        run_until_idle(&mut ring);
        assert_eq!(ring.context().completed, 4);
    }

    #[test]
    fn test_push_from_completion() {
        let mut ring = test_ring(8);
        ring.push(TestOp::Chain(5)).unwrap();
        run_until_idle(&mut ring);
        assert_eq!(ring.context().completed, 6);
    }

    #[test]
    fn test_backpressure_beyond_queue_depth() {
        // More ops than submission queue slots; the overflow is buffered
        // and flushed as completions retire earlier entries.
        let mut ring = test_ring(4);
        for _ in 0..64 {
            ring.push(TestOp::Nop).unwrap();
        }
        run_until_idle(&mut ring);
        assert_eq!(ring.context().completed, 64);
    }

    #[test]
    fn test_wait_timeout_with_no_work() {
        let mut ring = test_ring(4);
        ring.submit_and_wait(1, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(ring.is_idle());
    }

    #[test]
    fn test_drain_retires_everything() {
        let mut ring = test_ring(8);
        for _ in 0..3 {
            ring.push(TestOp::Chain(2)).unwrap();
        }
        ring.submit().unwrap();
        ring.drain().unwrap();
        assert!(ring.is_idle());
        assert_eq!(ring.context().completed, 9);
    }
}
