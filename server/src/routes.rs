//! Route registry and dispatch: maps a parsed request onto one of the four
//! route families and assembles the reply operations.

use {
    crate::{
        cache::SMALL_CACHE_PATH,
        http,
        jobs::{Job, JobState},
        messages,
        ops::{Ctx, FileStatOp, JobWaitOp, ServerOp, UserRequest, WriteDirectOp, WritePayload, WriteVectoredOp},
        HEADER_BUFFER_MAX,
    },
    log::debug,
    std::{collections::BTreeMap, ffi::CString, os::fd::OwnedFd, sync::Arc},
    thiserror::Error,
};

const HELLO_BODY: &[u8] = br#"{"message":"Hello, world!"}"#;

/// Buffer size for inline-formatted dynamic bodies.
const DYNAMIC_BODY_MAX: usize = 256;

/// Largest `/fib` input accepted; the compute is intentionally exponential
/// and anything beyond this would pin a worker for minutes.
const MAX_FIB_INPUT: u64 = 40;

/// Recoverable request failures, each mapped to a canned reply.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("request could not be parsed")]
    MalformedRequest,
    #[error("unsupported request verb")]
    UnsupportedVerb,
    #[error("no route matches the request path")]
    RouteNotFound,
    #[error("request processing failed")]
    Internal,
}

impl RouteError {
    fn reply(&self) -> &'static [u8] {
        match self {
            Self::MalformedRequest => messages::MALFORMED_REQUEST_MSG.as_bytes(),
            Self::UnsupportedVerb => messages::UNSUPPORTED_VERB_MSG.as_bytes(),
            Self::RouteNotFound => messages::CONTENT_404_MSG.as_bytes(),
            Self::Internal => messages::INTERNAL_SERVER_ERROR_MSG.as_bytes(),
        }
    }
}

/// Dispatch target for one registered path.
#[derive(Clone, Copy)]
pub enum RouteKind {
    /// Immediate response with a fixed JSON body.
    FixedJson(&'static [u8]),
    /// File-backed contents resolved against the static root.
    File { memoize: bool },
    /// Dynamic body formatted inline from the request payload.
    DynamicGreeting,
    /// Compute job executed off the reactor.
    ComputeFibonacci,
}

/// Path-equality registry the reactor consults on every request.
pub struct RouteTable {
    entries: BTreeMap<&'static str, RouteKind>,
}

impl RouteTable {
    pub fn with_default_routes() -> Self {
        let mut table = Self {
            entries: BTreeMap::new(),
        };
        table.register("/sample.json", RouteKind::File { memoize: true });
        table.register("/hello", RouteKind::FixedJson(HELLO_BODY));
        table.register("/helloname", RouteKind::DynamicGreeting);
        table.register("/fib", RouteKind::ComputeFibonacci);
        table
    }

    pub fn register(&mut self, path: &'static str, kind: RouteKind) {
        self.entries.insert(path, kind);
    }

    pub fn lookup(&self, path: &str) -> Option<RouteKind> {
        self.entries.get(path).copied()
    }
}

/// Entry point from the client-read completion.
pub(crate) fn dispatch(completion: &mut Ctx<'_>, client: OwnedFd, raw: &[u8]) {
    let Some(request) = http::parse(raw) else {
        let req = UserRequest::new(client, "", None);
        reply_error(completion, req, RouteError::MalformedRequest);
        return;
    };

    let req = UserRequest::new(client, request.path, request.body);
    if !http::is_get(request.method) {
        reply_error(completion, req, RouteError::UnsupportedVerb);
        return;
    }

    debug!("dispatching {}", req.route());
    match completion.context().routes.lookup(request.path) {
        Some(RouteKind::File { memoize }) => file_route(completion, req, memoize),
        Some(RouteKind::FixedJson(body)) => fixed_json_route(completion, req, body),
        Some(RouteKind::DynamicGreeting) => helloname_route(completion, req),
        Some(RouteKind::ComputeFibonacci) => fib_route(completion, req),
        None => reply_error(completion, req, RouteError::RouteNotFound),
    }
}

/// Queue the canned reply for `err`; the request moves into the write and
/// its socket closes when the write completes.
pub(crate) fn reply_error(completion: &mut Ctx<'_>, req: UserRequest, err: RouteError) {
    debug!("{err} (route {:?})", req.route());
    completion.context_mut().stats.error_replies += 1;
    completion.push(ServerOp::WriteDirect(WriteDirectOp::new(req, err.reply())));
}

/// Reply with memoized file contents: built headers + shared bytes.
pub(crate) fn reply_cached(completion: &mut Ctx<'_>, req: UserRequest, data: Arc<[u8]>) {
    let context = completion.context_mut();
    let mut header = context.pool.acquire(HEADER_BUFFER_MAX);
    let header_len = messages::build_file_headers(req.route(), data.len(), &mut header);
    completion.push(ServerOp::WriteVectored(WriteVectoredOp::new(
        req,
        WritePayload::Pooled {
            buf: header,
            len: header_len,
        },
        WritePayload::Cached(data),
    )));
}

/// File service: memoized contents, or a stat→open→read→close chain on the
/// first request for a path.
fn file_route(completion: &mut Ctx<'_>, req: UserRequest, memoize: bool) {
    if req.route().len() > SMALL_CACHE_PATH {
        // Longer paths do not fit a cache key; nothing is served for them.
        reply_error(completion, req, RouteError::RouteNotFound);
        return;
    }

    if let Some(data) = completion.context().cache.get(req.route()) {
        debug!("cache hit for {}", req.route());
        completion.context_mut().stats.cache_hits += 1;
        reply_cached(completion, req, data);
        return;
    }

    completion.context_mut().stats.cache_misses += 1;
    let resolved = format!("{}{}", completion.context().static_root, req.route());
    let Ok(path) = CString::new(resolved) else {
        reply_error(completion, req, RouteError::Internal);
        return;
    };
    completion.push(ServerOp::FileStat(FileStatOp::new(req, path, memoize)));
}

/// Immediate response of a fixed JSON body.
fn fixed_json_route(completion: &mut Ctx<'_>, req: UserRequest, body: &'static [u8]) {
    let context = completion.context_mut();
    let mut header = context.pool.acquire(HEADER_BUFFER_MAX);
    let header_len = messages::build_dynamic_headers(body.len(), &mut header);
    completion.push(ServerOp::WriteVectored(WriteVectoredOp::new(
        req,
        WritePayload::Pooled {
            buf: header,
            len: header_len,
        },
        WritePayload::Static(body),
    )));
}

/// Dynamic response computed inline from the request body.
fn helloname_route(completion: &mut Ctx<'_>, req: UserRequest) {
    let Some(name) = string_field(req.body(), "name") else {
        reply_error(completion, req, RouteError::MalformedRequest);
        return;
    };

    let mut body = completion.context_mut().pool.acquire(DYNAMIC_BODY_MAX);
    let mut cursor = std::io::Cursor::new(body.as_mut_slice());
    if std::io::Write::write_all(
        &mut cursor,
        format!("{{\"message\":\"Hello, {name}!\"}}").as_bytes(),
    )
    .is_err()
    {
        // Name too long for the dynamic body buffer.
        completion.context_mut().pool.release(body);
        reply_error(completion, req, RouteError::MalformedRequest);
        return;
    }
    let body_len = cursor.position() as usize;

    let mut header = completion.context_mut().pool.acquire(HEADER_BUFFER_MAX);
    let header_len = messages::build_dynamic_headers(body_len, &mut header);
    completion.push(ServerOp::WriteVectored(WriteVectoredOp::new(
        req,
        WritePayload::Pooled {
            buf: header,
            len: header_len,
        },
        WritePayload::Pooled {
            buf: body,
            len: body_len,
        },
    )));
}

/// Compute response run on the worker pool; the reactor parks a futex wait
/// and stays responsive while the job runs.
fn fib_route(completion: &mut Ctx<'_>, req: UserRequest) {
    let Some(value) = integer_field(req.body(), "value") else {
        reply_error(completion, req, RouteError::MalformedRequest);
        return;
    };
    if value > MAX_FIB_INPUT {
        reply_error(completion, req, RouteError::MalformedRequest);
        return;
    }

    let state = Arc::new(JobState::new());
    let job = Job {
        value: value as u32,
        state: Arc::clone(&state),
    };
    if completion.context_mut().jobs.submit(job).is_err() {
        reply_error(completion, req, RouteError::Internal);
        return;
    }
    completion.context_mut().stats.jobs_submitted += 1;
    completion.push(ServerOp::JobWait(JobWaitOp::new(req, state)));
}

fn string_field(body: Option<&[u8]>, field: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body?).ok()?;
    Some(value.get(field)?.as_str()?.to_owned())
}

fn integer_field(body: Option<&[u8]>, field: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(body?).ok()?;
    value.get(field)?.as_u64()
}
