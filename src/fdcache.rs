//! Bounded, TTL-evicting cache of shared archive readers.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use lru::LruCache;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::archive::ArchiveReader;
use crate::entry::EntryReader;
use crate::errors::FsError;
use crate::errors::Result;
use crate::metrics::Metrics;
use crate::options::Options;
use crate::semaphore::Semaphore;

struct CachedArchive {
    reader: Arc<ArchiveReader>,
    last_used: Instant,
}

struct CacheState {
    entries: Mutex<LruCache<PathBuf, CachedArchive>>,
    ttl: Duration,
    stopped: Mutex<bool>,
    wake: Condvar,
    sem: Arc<Semaphore>,
    options: Arc<Options>,
    metrics: Arc<Metrics>,
}

/// Cache of open archive readers keyed by archive path, bounded by
/// `fd-cache-size` and expired after `fd-cache-ttl` of idleness.
///
/// The cache holds exactly one reference per cached reader; every
/// borrower returned from [`FdCache::archive`] holds its own.
pub(crate) struct FdCache {
    state: Arc<CacheState>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl FdCache {
    pub(crate) fn new(
        options: Arc<Options>,
        sem: Arc<Semaphore>,
        metrics: Arc<Metrics>,
    ) -> FdCache {
        // a zero-size cache never stores (see CacheState::bypassing); the
        // LRU type itself still needs a nonzero bound
        let capacity = NonZeroUsize::new(options.fd_cache_size).unwrap_or(NonZeroUsize::MIN);
        let state = Arc::new(CacheState {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: options.fd_cache_ttl,
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            sem,
            options,
            metrics,
        });
        let reaper = {
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("zipdirfs-fdcache".to_owned())
                .spawn(move || state.reap_loop())
                .map_err(|err| warn!("fd cache reaper did not start: {err}"))
                .ok()
        };
        FdCache {
            state,
            reaper: Mutex::new(reaper),
        }
    }

    /// Returns a shared reader for `path`. The caller owns one reference
    /// and must release it.
    pub(crate) fn archive(&self, path: &Path) -> Result<Arc<ArchiveReader>> {
        let state = &self.state;
        if !state.bypassing() {
            let mut expired = None;
            let mut hit = None;
            {
                let mut entries = state.entries.lock();
                if let Some(cached) = entries.get_mut(path) {
                    if cached.last_used.elapsed() <= state.ttl {
                        cached.last_used = Instant::now();
                        cached.reader.acquire();
                        hit = Some(Arc::clone(&cached.reader));
                    } else {
                        expired = entries.pop(path);
                    }
                }
            }
            if let Some(stale) = expired {
                debug!("fd cache expired {} on access", path.display());
                state.release_cached(stale);
            }
            if let Some(reader) = hit {
                state.metrics.fd_cache_hit();
                return Ok(reader);
            }
        }
        state.metrics.fd_cache_miss();
        let reader = ArchiveReader::open(
            path,
            &state.sem,
            Arc::clone(&state.options),
            Arc::clone(&state.metrics),
        )
        .map_err(|err| FsError::Invalid(format!("cannot open {}: {err}", path.display())))?;
        if state.bypassing() {
            return Ok(reader);
        }
        reader.acquire();
        let displaced = {
            let mut entries = state.entries.lock();
            entries.push(
                path.to_path_buf(),
                CachedArchive {
                    reader: Arc::clone(&reader),
                    last_used: Instant::now(),
                },
            )
        };
        if let Some((_, old)) = displaced {
            state.release_cached(old);
        }
        Ok(reader)
    }

    /// Opens the entry `inner` of the archive at `path`, returning the
    /// caller's archive reference together with the entry reader.
    pub(crate) fn entry(
        &self,
        path: &Path,
        inner: &str,
    ) -> Result<(Arc<ArchiveReader>, EntryReader)> {
        let archive = self.archive(path)?;
        let started = Instant::now();
        let found = archive.find_entry(inner).map(|info| info.ordinal);
        self.state.metrics.metadata_read(started.elapsed());
        let Some(ordinal) = found else {
            self.state.release_borrowed(&archive);
            return Err(FsError::NotFound(format!(
                "{}: no entry {inner}",
                path.display()
            )));
        };
        match archive.open_entry(ordinal) {
            Ok(reader) => Ok((archive, reader)),
            Err(err) => {
                self.state.release_borrowed(&archive);
                Err(err)
            }
        }
    }

    /// Prepares for unmount: turn on cache bypass so in-flight opens no
    /// longer store into the cache, then drop every cached reader.
    /// Returns the previous bypass state so the caller can restore it if
    /// the unmount is abandoned.
    pub(crate) fn halt_and_purge(&self) -> bool {
        let state = &self.state;
        let previous = state.options.fd_cache_bypass();
        state.options.set_fd_cache_bypass(true);
        let drained: Vec<CachedArchive> = {
            let mut entries = state.entries.lock();
            let mut out = Vec::with_capacity(entries.len());
            while let Some((_, cached)) = entries.pop_lru() {
                out.push(cached);
            }
            out
        };
        for cached in drained {
            state.release_cached(cached);
        }
        previous
    }

    /// Stops the reaper thread and blocks until it exits.
    pub(crate) fn destroy(&self) {
        *self.state.stopped.lock() = true;
        self.state.wake.notify_all();
        if let Some(handle) = self.reaper.lock().take() {
            if handle.join().is_err() {
                warn!("fd cache reaper exited abnormally");
            }
        }
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.state.entries.lock().len()
    }
}

impl Drop for FdCache {
    fn drop(&mut self) {
        self.destroy();
        self.halt_and_purge();
    }
}

impl fmt::Debug for FdCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdCache")
            .field("cached", &self.state.entries.lock().len())
            .field("ttl", &self.state.ttl)
            .finish()
    }
}

impl CacheState {
    /// Whether opens skip the cache: the runtime bypass toggle is on, or
    /// the cache was configured with zero capacity.
    fn bypassing(&self) -> bool {
        self.options.fd_cache_size == 0 || self.options.fd_cache_bypass()
    }

    fn release_cached(&self, cached: CachedArchive) {
        if let Err(err) = cached.reader.release() {
            warn!(
                "fd cache reference to {} was gone: {err}",
                cached.reader.path().display()
            );
        }
    }

    fn release_borrowed(&self, reader: &Arc<ArchiveReader>) {
        if let Err(err) = reader.release() {
            warn!("release of {} failed: {err}", reader.path().display());
        }
    }

    fn reap_loop(&self) {
        let interval = (self.ttl / 2).max(Duration::from_millis(10));
        loop {
            {
                let mut stopped = self.stopped.lock();
                if *stopped {
                    return;
                }
                self.wake.wait_for(&mut stopped, interval);
                if *stopped {
                    return;
                }
            }
            self.sweep();
        }
    }

    fn sweep(&self) {
        let expired: Vec<CachedArchive> = {
            let mut entries = self.entries.lock();
            let stale: Vec<PathBuf> = entries
                .iter()
                .filter(|(_, cached)| cached.last_used.elapsed() > self.ttl)
                .map(|(path, _)| path.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|path| entries.pop(&path))
                .collect()
        };
        for cached in expired {
            debug!("fd cache expired {}", cached.reader.path().display());
            self.release_cached(cached);
        }
    }
}
