//! Pooled per-request scratch state

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::HubResult;
use crate::protocol::{encode_into, ProtocolMessage};

const INITIAL_BUFFER: usize = 1024;

/// Scratch state owned by one in-flight request
#[derive(Debug)]
pub struct SyncContext {
    buffer: Vec<u8>,
}

impl SyncContext {
    fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(INITIAL_BUFFER),
        }
    }

    /// Serialize a message through the reusable buffer
    pub fn encode(&mut self, message: &ProtocolMessage) -> HubResult<Bytes> {
        encode_into(message, &mut self.buffer)?;
        Ok(Bytes::copy_from_slice(&self.buffer))
    }

    fn reset(&mut self, max_retained: usize) {
        self.buffer.clear();
        if self.buffer.capacity() > max_retained {
            self.buffer.shrink_to(INITIAL_BUFFER);
        }
    }
}

/// Bounded free-list of [`SyncContext`]s, shared per hub.
///
/// The lock only guards push and pop; a context is never touched by the pool
/// while a request holds it.
pub struct ContextPool {
    free: Mutex<Vec<SyncContext>>,
    max_pooled: usize,
    max_buffer: usize,
    created: AtomicUsize,
}

impl ContextPool {
    pub fn new(max_pooled: usize, max_buffer: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            max_buffer,
            created: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> SyncContext {
        if let Some(context) = self.free.lock().pop() {
            return context;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        SyncContext::new()
    }

    /// Reset and return a context. Dropped when the pool is full.
    pub fn release(&self, mut context: SyncContext) {
        context.reset(self.max_buffer);
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(context);
        }
    }

    /// Contexts currently idle in the pool
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }

    /// Contexts allocated since the pool was created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}
