//! Off-reactor compute jobs and their futex rendezvous with the ring.
//!
//! A compute route allocates a [`JobState`], hands the job to the worker
//! pool, and parks a futex-wait submission against the state's word. The
//! worker fills a result buffer, flips the word, and wakes the futex;
//! exactly one wake per wait. A worker that panics still wakes, with an
//! empty result the reactor turns into a 500.

use {
    crate::job_buffer::{JobBuffer, JobBufferPool},
    crossbeam_channel::{bounded, Receiver, Sender, TrySendError},
    log::{debug, warn},
    std::{
        io::{self, Cursor},
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
        thread,
    },
};

/// Jobs admitted but not yet picked up by a worker.
const JOB_QUEUE_DEPTH: usize = 64;

/// A unit of compute handed to the worker pool.
pub struct Job {
    pub value: u32,
    pub state: Arc<JobState>,
}

/// Rendezvous state between one job and its parked futex-wait submission.
pub struct JobState {
    futex: AtomicU32,
    result: Mutex<Option<(JobBuffer, usize)>>,
}

impl JobState {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            result: Mutex::new(None),
        }
    }

    /// Address of the futex word for the wait submission.
    pub fn futex_ptr(&self) -> *const u32 {
        self.futex.as_ptr()
    }

    pub fn is_complete(&self) -> bool {
        self.futex.load(Ordering::Acquire) != 0
    }

    /// Take the result buffer and its length; `None` when the job failed.
    pub fn take_result(&self) -> Option<(JobBuffer, usize)> {
        self.result.lock().unwrap().take()
    }

    fn finish(&self, result: Option<(JobBuffer, usize)>) {
        *self.result.lock().unwrap() = result;
        self.futex.store(1, Ordering::Release);
        futex_wake(&self.futex);
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

fn futex_wake(word: &AtomicU32) {
    // Safety: FUTEX_WAKE on a word we own; wakes the ring's parked wait.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        )
    };
    if rc < 0 {
        warn!("futex wake failed: {}", io::Error::last_os_error());
    }
}

/// Bounded worker pool executing compute jobs off the reactor thread.
///
/// Dropping the pool closes the queue; workers drain it and exit, and the
/// threads are joined.
pub struct JobPool {
    sender: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl JobPool {
    pub fn new(num_workers: usize, buffers: Arc<JobBufferPool>) -> io::Result<Self> {
        let (sender, receiver) = bounded::<Job>(JOB_QUEUE_DEPTH);
        let workers = (0..num_workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                let buffers = Arc::clone(&buffers);
                thread::Builder::new()
                    .name(format!("ringJobWkr{index:02}"))
                    .spawn(move || worker_loop(&receiver, &buffers))
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Hand `job` to the pool without blocking the caller.
    ///
    /// Fails when the queue is full or the pool is shutting down; the
    /// caller replies 500 in that case.
    pub fn submit(&self, job: Job) -> Result<(), TrySendError<Job>> {
        self.sender
            .as_ref()
            .expect("queue is open until the pool drops")
            .try_send(job)
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("compute worker exited abnormally");
            }
        }
    }
}

fn worker_loop(receiver: &Receiver<Job>, buffers: &JobBufferPool) {
    while let Ok(Job { value, state }) = receiver.recv() {
        debug!("computing fibonacci({value})");
        let result = panic::catch_unwind(AssertUnwindSafe(|| run_job(value, buffers)))
            .unwrap_or_else(|_| {
                warn!("compute job for value {value} panicked");
                None
            });
        state.finish(result);
    }
}

fn run_job(value: u32, buffers: &JobBufferPool) -> Option<(JobBuffer, usize)> {
    let result = fibonacci(u64::from(value));
    let mut buf = buffers.acquire();
    let mut cursor = Cursor::new(buf.as_mut_slice());
    serde_json::to_writer(&mut cursor, &serde_json::json!({ "result": result })).ok()?;
    let len = cursor.position() as usize;
    Some((buf, len))
}

/// Deliberately naive recursion; this is the workload that keeps a worker
/// busy while the reactor stays responsive.
fn fibonacci(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fibonacci(n - 1) + fibonacci(n - 2)
    }
}
