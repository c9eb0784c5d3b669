use std::fmt;
use std::mem;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::metrics::Metrics;

/// Pool of reusable, fixed-capacity read buffers for streaming handles.
///
/// Requests larger than the pooled capacity get a one-off allocation that
/// is not returned to the pool.
pub(crate) struct BufferPool {
    buf_size: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
    metrics: Arc<Metrics>,
}

impl BufferPool {
    pub(crate) fn new(buf_size: usize, metrics: Arc<Metrics>) -> BufferPool {
        BufferPool {
            buf_size,
            bufs: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Hands out a buffer of at least `want` bytes.
    pub(crate) fn acquire(&self, want: usize) -> PooledBuf<'_> {
        if want > self.buf_size {
            self.metrics.pool_miss(want);
            return PooledBuf {
                buf: vec![0; want],
                home: None,
            };
        }
        let buf = self
            .bufs
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0; self.buf_size]);
        self.metrics.pool_hit(want);
        PooledBuf {
            buf,
            home: Some(self),
        }
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() == self.buf_size {
            self.bufs.lock().push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.bufs.lock().len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buf_size", &self.buf_size)
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`]; pooled buffers go back on
/// drop, on every exit path.
pub(crate) struct PooledBuf<'a> {
    buf: Vec<u8>,
    home: Option<&'a BufferPool>,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.home {
            pool.put(mem::take(&mut self.buf));
        }
    }
}

impl fmt::Debug for PooledBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}
