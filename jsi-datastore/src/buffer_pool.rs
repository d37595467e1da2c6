//! C2: bounded buffer pool.
//!
//! Ingestion and restore both move fixed-size byte buffers between a
//! producer thread and a pool of worker threads; reallocating one per
//! chunk would put constant pressure on the allocator. The pool hands out
//! RAII guards the same way the teacher's `ProcessLocker` hands out lock
//! guards that release on drop, rather than exposing an explicit
//! `release()` callers can forget.

use std::sync::{Condvar, Mutex};

struct Inner {
    free: Vec<Vec<u8>>,
    outstanding: usize,
}

/// A pool of `capacity` reusable buffers, each pre-sized to `buf_size`.
/// Acquiring beyond capacity blocks until a buffer is returned.
pub struct BufferPool {
    buf_size: usize,
    capacity: usize,
    state: Mutex<Inner>,
    available: Condvar,
}

impl BufferPool {
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Vec::with_capacity(buf_size));
        }
        Self {
            buf_size,
            capacity,
            state: Mutex::new(Inner {
                free,
                outstanding: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Blocks until a buffer is available, then hands out an owning guard.
    pub fn acquire(self: &std::sync::Arc<Self>) -> PooledBuffer {
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(mut buf) = guard.free.pop() {
                buf.clear();
                guard.outstanding += 1;
                return PooledBuffer {
                    buf: Some(buf),
                    pool: std::sync::Arc::clone(self),
                };
            }
            guard = self.available.wait(guard).unwrap();
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }

    fn release(&self, mut buf: Vec<u8>) {
        let mut guard = self.state.lock().unwrap();
        guard.outstanding -= 1;
        if guard.free.len() < self.capacity {
            buf.clear();
            guard.free.push(buf);
        }
        self.available.notify_one();
    }
}

/// A buffer checked out of a [`BufferPool`]. Returned to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: std::sync::Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
