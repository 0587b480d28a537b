//! The reactor: ring ownership, shared context, run loop, shutdown.

use {
    crate::{
        alloc::BytePool,
        cache::FileCache,
        job_buffer::JobBufferPool,
        jobs::JobPool,
        ops::{AcceptOp, ServerOp},
        routes::RouteTable,
    },
    io_uring::IoUring,
    log::{info, warn},
    ringhook_reactor::Ring,
    std::{
        io,
        net::TcpListener,
        os::fd::AsRawFd,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    thiserror::Error,
};

/// Ring submission/completion queue depth.
pub const QUEUE_DEPTH: u32 = 256;

/// Root directory resolved for file routes, relative to the working
/// directory.
pub const STATIC_ROOT: &str = "static";

/// How long one completion wait blocks before the loop rechecks the
/// shutdown flag.
const WAIT_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to initialize the ring: {0}")]
    RingInit(#[source] io::Error),
    #[error("failed to start compute workers: {0}")]
    WorkerSpawn(#[source] io::Error),
}

pub struct ServerConfig {
    pub static_root: String,
    pub worker_threads: usize,
    pub queue_depth: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            static_root: STATIC_ROOT.to_string(),
            worker_threads: num_cpus::get().clamp(1, 4),
            queue_depth: QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub accepted: u64,
    pub responses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub error_replies: u64,
}

impl ServerStats {
    fn log(&self) {
        info!(
            "served {} responses for {} connections - cache {}/{} hit/miss, {} jobs, {} error \
             replies",
            self.responses,
            self.accepted,
            self.cache_hits,
            self.cache_misses,
            self.jobs_completed,
            self.error_replies,
        );
    }
}

/// State shared by every operation of the ring: the pools, the file cache,
/// the worker pool, and counters. Owned by the reactor thread; only the job
/// buffer pool is shared with workers.
pub struct ServerContext {
    pub(crate) pool: BytePool,
    pub(crate) cache: FileCache,
    pub(crate) job_buffers: Arc<JobBufferPool>,
    pub(crate) jobs: JobPool,
    pub(crate) routes: RouteTable,
    pub(crate) static_root: String,
    pub(crate) stats: ServerStats,
    shutting_down: bool,
}

impl ServerContext {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
}

/// The server: a bound listener plus the ring that drives it.
pub struct HookServer {
    ring: Ring<ServerContext, ServerOp>,
    listener: TcpListener,
}

impl HookServer {
    /// Consume a bound listener and stand up the ring and worker pool.
    pub fn new(listener: TcpListener, config: ServerConfig) -> Result<Self, ServerError> {
        let io_uring = IoUring::new(config.queue_depth).map_err(ServerError::RingInit)?;
        let job_buffers = Arc::new(JobBufferPool::new());
        let jobs = JobPool::new(config.worker_threads, Arc::clone(&job_buffers))
            .map_err(ServerError::WorkerSpawn)?;
        let context = ServerContext {
            pool: BytePool::new(),
            cache: FileCache::new(),
            job_buffers,
            jobs,
            routes: RouteTable::with_default_routes(),
            static_root: config.static_root,
            stats: ServerStats::default(),
            shutting_down: false,
        };
        Ok(Self {
            ring: Ring::new(io_uring, context),
            listener,
        })
    }

    /// Pump the ring until `shutdown` is raised.
    ///
    /// Each iteration submits whatever the previous drain queued, waits for
    /// at least one completion (bounded so the flag stays responsive), and
    /// dispatches everything visible.
    pub fn run(mut self, shutdown: &AtomicBool) -> io::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("listening on {addr}");
        }
        self.ring
            .push(ServerOp::Accept(AcceptOp::new(self.listener.as_raw_fd())))?;
        self.ring.submit()?;

        while !shutdown.load(Ordering::Relaxed) {
            self.ring.submit_and_wait(1, Some(WAIT_TICK))?;
            self.ring.process_completions()?;
        }
        self.shutdown()
    }

    /// Stop accepting, retire in-flight work, release the cache.
    fn shutdown(mut self) -> io::Result<()> {
        info!("shutting down");
        self.ring.context_mut().shutting_down = true;
        self.ring.cancel_all()?;
        self.ring.drain()?;

        let context = self.ring.context_mut();
        context.cache.clear();
        context.stats.log();
        if context.pool.outstanding() > 0 {
            warn!(
                "{} pooled buffers still outstanding at exit",
                context.pool.outstanding()
            );
        }
        info!("shutdown complete");
        Ok(())
    }
}
