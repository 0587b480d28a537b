//! An HTTP/1.0 hook server built directly on `io_uring`.
//!
//! A single reactor thread owns the ring and drives every request through a
//! chain of continuation operations: accept → read → route → (cached reply |
//! file stat/open/read/close | inline dynamic reply | compute job) → write →
//! close. Compute jobs run on a small worker pool and signal the reactor
//! back through a futex-wait submission, so the reactor never blocks outside
//! its completion wait.
//!
//! Request-scoped buffers come from a size-class [`alloc::BytePool`]; job
//! results travel in fixed buffers from the cross-thread
//! [`job_buffer::JobBufferPool`]; file contents are memoized in the
//! [`cache::FileCache`].

pub mod alloc;
pub mod cache;
pub mod http;
pub mod job_buffer;
pub mod jobs;
pub mod messages;
pub mod ops;
pub mod routes;
pub mod server;

/// Upper bound for a single HTTP request; requests are read with one
/// submission into one buffer of this size.
pub const HTTP_MAX_REQUEST_BUFFER_SIZE: usize = 8192;

/// Response header builders write into buffers of this size.
pub const HEADER_BUFFER_MAX: usize = 512;
