use std::fmt;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// Counting semaphore bounding the number of simultaneously open archive
/// descriptors. Acquisition blocks the calling thread until a permit is
/// free.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Arc<Semaphore> {
        Arc::new(Semaphore {
            permits: Mutex::new(permits),
            freed: Condvar::new(),
        })
    }

    /// Takes one permit, blocking while none are available.
    pub(crate) fn acquire(self: &Arc<Semaphore>) -> SemaphorePermit {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.freed.wait(&mut permits);
        }
        *permits -= 1;
        SemaphorePermit {
            sem: Arc::clone(self),
        }
    }

    /// Permits currently available.
    pub(crate) fn available(&self) -> usize {
        *self.permits.lock()
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.freed.notify_one();
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .finish()
    }
}

/// Permit held while an archive descriptor is open; returned on drop.
pub(crate) struct SemaphorePermit {
    sem: Arc<Semaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.sem.release();
    }
}

impl fmt::Debug for SemaphorePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SemaphorePermit")
    }
}
