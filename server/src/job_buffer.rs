//! Fixed-size result buffers shared between compute workers and the reactor.
//!
//! Unlike the reactor-local byte pool this free list crosses threads:
//! workers acquire, the reactor releases once the response write completes.
//! One coarse mutex is enough — it is taken once per job start and once per
//! job completion.

use std::sync::Mutex;

/// Size of a single job result buffer.
pub const JOB_BUFFER_SIZE: usize = 8192;

/// An owned result buffer checked out of a [`JobBufferPool`].
pub struct JobBuffer {
    data: Box<[u8]>,
}

impl JobBuffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

/// Mutex-guarded free list of [`JOB_BUFFER_SIZE`] buffers.
#[derive(Default)]
pub struct JobBufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl JobBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> JobBuffer {
        let recycled = self.free.lock().unwrap().pop();
        match recycled {
            Some(data) => JobBuffer { data },
            None => JobBuffer {
                data: vec![0u8; JOB_BUFFER_SIZE].into_boxed_slice(),
            },
        }
    }

    pub fn release(&self, buf: JobBuffer) {
        self.free.lock().unwrap().push(buf.data);
    }
}
