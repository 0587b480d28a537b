//! Continuation operations for the per-request state machine.
//!
//! Every request is driven by a chain of [`ServerOp`]s submitted to the
//! ring. Each completion consumes the resources of its operation and either
//! pushes the successor or finishes the request; buffers and descriptors
//! travel by move, so every chain ends in exactly one release and one client
//! close.
//!
//! Pointers handed to the kernel always target heap memory owned by the
//! operation (pooled buffers, `CString` paths, `Arc` interiors) — never the
//! operation's inline fields, which may move inside the in-flight table.

use {
    crate::{
        alloc::PooledBuf,
        job_buffer::JobBuffer,
        jobs::JobState,
        routes::{self, RouteError},
        server::ServerContext,
        HTTP_MAX_REQUEST_BUFFER_SIZE,
    },
    io_uring::{opcode, squeue, types},
    log::{debug, warn},
    ringhook_reactor::{Completion, RingOp},
    std::{
        ffi::CString,
        io, mem,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        sync::Arc,
    },
};

pub(crate) type Ctx<'a> = Completion<'a, ServerContext, ServerOp>;

/// Per-connection request state extracted from the HTTP read.
///
/// Owns the client socket; dropping the request closes it, which makes the
/// close-exactly-once guarantee a consequence of move semantics.
pub struct UserRequest {
    client: OwnedFd,
    route: Box<str>,
    body: Option<Box<[u8]>>,
}

impl UserRequest {
    pub fn new(client: OwnedFd, route: &str, body: Option<&[u8]>) -> Self {
        Self {
            client,
            route: route.into(),
            body: body.map(Box::from),
        }
    }

    pub fn client_fd(&self) -> RawFd {
        self.client.as_raw_fd()
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

/// A response fragment together with its release discipline.
pub enum WritePayload {
    /// Borrowed from static storage; nothing to release.
    Static(&'static [u8]),
    /// Shared cache contents; the handle drops with the operation.
    Cached(Arc<[u8]>),
    /// Checked out of the byte pool; returned on write completion.
    Pooled { buf: PooledBuf, len: usize },
    /// A compute result; returned to the job buffer pool on completion.
    Job { buf: JobBuffer, len: usize },
}

impl WritePayload {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Self::Static(data) => data.as_ptr(),
            Self::Cached(data) => data.as_ptr(),
            Self::Pooled { buf, .. } => buf.as_ptr(),
            Self::Job { buf, .. } => buf.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Static(data) => data.len(),
            Self::Cached(data) => data.len(),
            Self::Pooled { len, .. } => *len,
            Self::Job { len, .. } => *len,
        }
    }

    fn release(self, context: &mut ServerContext) {
        match self {
            Self::Static(_) | Self::Cached(_) => {}
            Self::Pooled { buf, .. } => context.pool.release(buf),
            Self::Job { buf, .. } => context.job_buffers.release(buf),
        }
    }
}

/// The closed set of continuation kinds.
pub enum ServerOp {
    Accept(AcceptOp),
    ReadClient(ReadClientOp),
    FileStat(FileStatOp),
    FileOpen(FileOpenOp),
    FileRead(FileReadOp),
    FileClose(FileCloseOp),
    WriteDirect(WriteDirectOp),
    WriteVectored(WriteVectoredOp),
    JobWait(JobWaitOp),
}

impl RingOp<ServerContext> for ServerOp {
    fn entry(&mut self) -> squeue::Entry {
        match self {
            Self::Accept(op) => op.entry(),
            Self::ReadClient(op) => op.entry(),
            Self::FileStat(op) => op.entry(),
            Self::FileOpen(op) => op.entry(),
            Self::FileRead(op) => op.entry(),
            Self::FileClose(op) => op.entry(),
            Self::WriteDirect(op) => op.entry(),
            Self::WriteVectored(op) => op.entry(),
            Self::JobWait(op) => op.entry(),
        }
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) -> io::Result<()> {
        match self {
            Self::Accept(op) => op.complete(completion, res),
            Self::ReadClient(op) => op.complete(completion, res),
            Self::FileStat(op) => op.complete(completion, res),
            Self::FileOpen(op) => op.complete(completion, res),
            Self::FileRead(op) => op.complete(completion, res),
            Self::FileClose(op) => op.complete(completion, res),
            Self::WriteDirect(op) => op.complete(completion, res),
            Self::WriteVectored(op) => op.complete(completion, res),
            Self::JobWait(op) => op.complete(completion, res),
        }
        Ok(())
    }
}

/// Multishot accept on the listening socket; one completion per connection.
pub struct AcceptOp {
    listener: RawFd,
}

impl AcceptOp {
    pub fn new(listener: RawFd) -> Self {
        Self { listener }
    }

    fn entry(&mut self) -> squeue::Entry {
        opcode::AcceptMulti::new(types::Fd(self.listener)).build()
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) {
        if !completion.more() && !completion.context().is_shutting_down() {
            // The kernel retired the multishot; re-arm before handling the
            // current result so no connection window is lost.
            debug!("re-arming multishot accept");
            completion.push(ServerOp::Accept(AcceptOp::new(self.listener)));
        }

        let fd = match res {
            Ok(fd) => fd,
            Err(err) => {
                if !completion.context().is_shutting_down() {
                    warn!("accept failed: {err}");
                }
                return;
            }
        };
        // Safety: the kernel handed us ownership of this descriptor.
        let client = unsafe { OwnedFd::from_raw_fd(fd) };
        if completion.context().is_shutting_down() {
            // Arrived mid-shutdown; nothing will cancel a read armed now,
            // so close instead of parking one.
            return;
        }
        debug!("accepted client {}", client.as_raw_fd());

        let context = completion.context_mut();
        context.stats.accepted += 1;
        let buf = context.pool.acquire(HTTP_MAX_REQUEST_BUFFER_SIZE);
        completion.push(ServerOp::ReadClient(ReadClientOp {
            client: Some(client),
            buf: Some(buf),
        }));
    }
}

/// One-shot read of the client's request into a pooled buffer.
pub struct ReadClientOp {
    client: Option<OwnedFd>,
    buf: Option<PooledBuf>,
}

impl ReadClientOp {
    fn entry(&mut self) -> squeue::Entry {
        let client = self.client.as_ref().expect("socket held until completion");
        let buf = self.buf.as_mut().expect("buffer held until completion");
        opcode::Read::new(
            types::Fd(client.as_raw_fd()),
            buf.as_mut_ptr(),
            HTTP_MAX_REQUEST_BUFFER_SIZE as u32,
        )
        .build()
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) {
        let client = self.client.take().expect("socket held until completion");
        let buf = self.buf.take().expect("buffer held until completion");

        match res {
            Ok(n) if n > 0 => {
                let raw = &buf.as_slice()[..(n as usize).min(buf.capacity())];
                routes::dispatch(completion, client, raw);
            }
            Ok(_) | Err(_) => {
                if let Err(err) = &res {
                    debug!("client read failed: {err}");
                }
                let req = UserRequest::new(client, "", None);
                routes::reply_error(completion, req, RouteError::MalformedRequest);
            }
        }
        completion.context_mut().pool.release(buf);
    }
}

/// `statx` on the resolved file path; carries the request through to open.
pub struct FileStatOp {
    req: Option<UserRequest>,
    path: Option<CString>,
    statx: Box<libc::statx>,
    memoize: bool,
}

impl FileStatOp {
    pub fn new(req: UserRequest, path: CString, memoize: bool) -> Self {
        // Safety: statx is plain old data filled in by the kernel.
        let statx = Box::new(unsafe { mem::zeroed::<libc::statx>() });
        Self {
            req: Some(req),
            path: Some(path),
            statx,
            memoize,
        }
    }

    fn entry(&mut self) -> squeue::Entry {
        let path = self.path.as_ref().expect("path held until completion");
        opcode::Statx::new(
            types::Fd(libc::AT_FDCWD),
            path.as_ptr(),
            (&mut *self.statx as *mut libc::statx).cast(),
        )
        .flags(libc::AT_STATX_SYNC_AS_STAT)
        .mask(libc::STATX_SIZE)
        .build()
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) {
        let req = self.req.take().expect("request held until completion");
        let path = self.path.take().expect("path held until completion");

        if let Err(err) = res {
            warn!("statx {path:?} failed: {err}");
            routes::reply_error(completion, req, RouteError::Internal);
            return;
        }

        completion.push(ServerOp::FileOpen(FileOpenOp {
            req: Some(req),
            path: Some(path),
            size: self.statx.stx_size as usize,
            memoize: self.memoize,
        }));
    }
}

/// `openat` of a stat'ed path.
pub struct FileOpenOp {
    req: Option<UserRequest>,
    path: Option<CString>,
    size: usize,
    memoize: bool,
}

impl FileOpenOp {
    fn entry(&mut self) -> squeue::Entry {
        let path = self.path.as_ref().expect("path held until completion");
        opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
            .flags(libc::O_RDONLY)
            .build()
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) {
        let req = self.req.take().expect("request held until completion");
        let path = self.path.take().expect("path held until completion");

        let fd = match res {
            Ok(fd) => fd,
            Err(err) => {
                warn!("open {path:?} failed: {err}");
                routes::reply_error(completion, req, RouteError::Internal);
                return;
            }
        };

        let buf = completion.context_mut().pool.acquire(self.size.max(1));
        completion.push(ServerOp::FileRead(FileReadOp {
            req: Some(req),
            path: Some(path),
            fd,
            buf: Some(buf),
            size: self.size,
            memoize: self.memoize,
        }));
    }
}

/// Read of the whole file; forks into the reply write and the fd close.
pub struct FileReadOp {
    req: Option<UserRequest>,
    path: Option<CString>,
    fd: RawFd,
    buf: Option<PooledBuf>,
    size: usize,
    memoize: bool,
}

impl FileReadOp {
    fn entry(&mut self) -> squeue::Entry {
        let buf = self.buf.as_mut().expect("buffer held until completion");
        opcode::Read::new(types::Fd(self.fd), buf.as_mut_ptr(), self.size as u32).build()
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) {
        let req = self.req.take().expect("request held until completion");
        let path = self.path.take().expect("path held until completion");
        let buf = self.buf.take().expect("buffer held until completion");

        // The descriptor is closed on every outcome; the request itself is
        // owned by the parallel write branch from here on.
        completion.push(ServerOp::FileClose(FileCloseOp {
            path: Some(path),
            fd: self.fd,
        }));

        let read = match res {
            Ok(n) => (n as usize).min(self.size),
            Err(err) => {
                warn!("file read for {} failed: {err}", req.route());
                completion.context_mut().pool.release(buf);
                routes::reply_error(completion, req, RouteError::Internal);
                return;
            }
        };

        if self.memoize {
            let data: Arc<[u8]> = Arc::from(&buf.as_slice()[..read]);
            let context = completion.context_mut();
            let stored = context
                .cache
                .insert(req.route(), Arc::clone(&data))
                .unwrap_or(data);
            context.pool.release(buf);
            routes::reply_cached(completion, req, stored);
        } else {
            let context = completion.context_mut();
            let mut header = context.pool.acquire(crate::HEADER_BUFFER_MAX);
            let header_len = crate::messages::build_file_headers(req.route(), read, &mut header);
            completion.push(ServerOp::WriteVectored(WriteVectoredOp::new(
                req,
                WritePayload::Pooled {
                    buf: header,
                    len: header_len,
                },
                WritePayload::Pooled { buf, len: read },
            )));
        }
    }
}

/// Closes the file descriptor opened for a file route. Terminal; the client
/// socket belongs to the parallel write branch.
pub struct FileCloseOp {
    path: Option<CString>,
    fd: RawFd,
}

impl FileCloseOp {
    fn entry(&mut self) -> squeue::Entry {
        opcode::Close::new(types::Fd(self.fd)).build()
    }

    fn complete(&mut self, _completion: &mut Ctx<'_>, res: io::Result<i32>) {
        let path = self.path.take();
        if let Err(err) = res {
            warn!("close of {path:?} failed: {err}");
        }
    }
}

/// Single-buffer write of a complete, self-contained response.
pub struct WriteDirectOp {
    req: Option<UserRequest>,
    data: &'static [u8],
}

impl WriteDirectOp {
    pub fn new(req: UserRequest, data: &'static [u8]) -> Self {
        Self {
            req: Some(req),
            data,
        }
    }

    fn entry(&mut self) -> squeue::Entry {
        let req = self.req.as_ref().expect("request held until completion");
        opcode::Write::new(
            types::Fd(req.client_fd()),
            self.data.as_ptr(),
            self.data.len() as u32,
        )
        .build()
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) {
        let req = self.req.take().expect("request held until completion");
        if let Err(err) = res {
            // The response is already committed; nothing to do but close.
            debug!("write to client {} failed: {err}", req.client_fd());
        }
        completion.context_mut().stats.responses += 1;
        // Dropping the request closes the client socket.
    }
}

/// Two-part (headers + body) vectored write; terminal for its request.
pub struct WriteVectoredOp {
    req: Option<UserRequest>,
    payloads: Option<[WritePayload; 2]>,
    iov: Box<[libc::iovec; 2]>,
}

// `libc::iovec` holds a raw pointer, making it !Send by default, but the
// pointers here always target heap memory owned exclusively by this struct
// (see module docs); the box is moved, never concurrently accessed.
unsafe impl Send for WriteVectoredOp {}

impl WriteVectoredOp {
    pub fn new(req: UserRequest, header: WritePayload, body: WritePayload) -> Self {
        let empty = libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        };
        Self {
            req: Some(req),
            payloads: Some([header, body]),
            iov: Box::new([empty; 2]),
        }
    }

    fn entry(&mut self) -> squeue::Entry {
        let req = self.req.as_ref().expect("request held until completion");
        let payloads = self.payloads.as_ref().expect("payloads held until completion");
        for (slot, payload) in self.iov.iter_mut().zip(payloads) {
            slot.iov_base = payload.as_ptr() as *mut _;
            slot.iov_len = payload.len();
        }
        opcode::Writev::new(types::Fd(req.client_fd()), self.iov.as_ptr().cast(), 2).build()
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) {
        let req = self.req.take().expect("request held until completion");
        let payloads = self.payloads.take().expect("payloads held until completion");

        let total: usize = payloads.iter().map(WritePayload::len).sum();
        match res {
            Ok(n) if (n as usize) < total => {
                debug!(
                    "short response write to client {} ({n}/{total})",
                    req.client_fd()
                );
            }
            Ok(_) => {}
            Err(err) => {
                debug!("write to client {} failed: {err}", req.client_fd());
            }
        }

        let context = completion.context_mut();
        for payload in payloads {
            payload.release(context);
        }
        context.stats.responses += 1;
        // Dropping the request closes the client socket.
    }
}

/// Futex wait parked against a compute job's completion word.
pub struct JobWaitOp {
    req: Option<UserRequest>,
    state: Arc<JobState>,
}

impl JobWaitOp {
    pub fn new(req: UserRequest, state: Arc<JobState>) -> Self {
        Self {
            req: Some(req),
            state,
        }
    }

    fn entry(&mut self) -> squeue::Entry {
        opcode::FutexWait::new(
            self.state.futex_ptr(),
            0, // wait while the word still reads "pending"
            u64::from(u32::MAX),
            (libc::FUTEX2_SIZE_U32 | libc::FUTEX2_PRIVATE) as u32,
        )
        .build()
    }

    fn complete(&mut self, completion: &mut Ctx<'_>, res: io::Result<i32>) {
        let req = self.req.take().expect("request held until completion");

        match res {
            Ok(_) => {}
            // The worker finished before the wait was armed.
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {}
            Err(err) => {
                warn!("futex wait for {} failed: {err}", req.route());
                routes::reply_error(completion, req, RouteError::Internal);
                return;
            }
        }

        let Some((buf, len)) = self.state.take_result() else {
            routes::reply_error(completion, req, RouteError::Internal);
            return;
        };
        if len == 0 {
            completion.context_mut().job_buffers.release(buf);
            routes::reply_error(completion, req, RouteError::Internal);
            return;
        }

        let context = completion.context_mut();
        context.stats.jobs_completed += 1;
        let mut header = context.pool.acquire(crate::HEADER_BUFFER_MAX);
        let header_len = crate::messages::build_dynamic_headers(len, &mut header);
        completion.push(ServerOp::WriteVectored(WriteVectoredOp::new(
            req,
            WritePayload::Pooled {
                buf: header,
                len: header_len,
            },
            WritePayload::Job { buf, len },
        )));
    }
}
