use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Activity counters owned by one filesystem instance.
///
/// All counters are atomic and safe to update from any thread; they are
/// monotonic (except the open-archives gauge) and may be read at any time
/// with no ordering requirements.
#[derive(Debug, Default)]
pub struct Metrics {
    archives_open: AtomicI64,
    archives_opened: AtomicU64,
    archives_closed: AtomicU64,
    entries_reopened: AtomicU64,
    metadata_reads: AtomicU64,
    metadata_read_ns: AtomicU64,
    extract_count: AtomicU64,
    extract_ns: AtomicU64,
    extract_bytes: AtomicU64,
    fd_cache_hits: AtomicU64,
    fd_cache_misses: AtomicU64,
    pool_hits: AtomicU64,
    pool_hit_bytes: AtomicU64,
    pool_misses: AtomicU64,
    pool_miss_bytes: AtomicU64,
    errors: AtomicU64,
}

impl Metrics {
    pub(crate) fn archive_opened(&self) {
        self.archives_open.fetch_add(1, Ordering::Relaxed);
        self.archives_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn archive_closed(&self) {
        self.archives_open.fetch_sub(1, Ordering::Relaxed);
        self.archives_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entry_reopened(&self) {
        self.entries_reopened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn metadata_read(&self, elapsed: Duration) {
        self.metadata_reads.fetch_add(1, Ordering::Relaxed);
        self.metadata_read_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn extract(&self, elapsed: Duration, bytes: usize) {
        self.extract_count.fetch_add(1, Ordering::Relaxed);
        self.extract_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.extract_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn fd_cache_hit(&self) {
        self.fd_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fd_cache_miss(&self) {
        self.fd_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pool_hit(&self, bytes: usize) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
        self.pool_hit_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn pool_miss(&self, bytes: usize) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
        self.pool_miss_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            archives_open: self.archives_open.load(Ordering::Relaxed),
            archives_opened: self.archives_opened.load(Ordering::Relaxed),
            archives_closed: self.archives_closed.load(Ordering::Relaxed),
            entries_reopened: self.entries_reopened.load(Ordering::Relaxed),
            metadata_reads: self.metadata_reads.load(Ordering::Relaxed),
            metadata_read_ns: self.metadata_read_ns.load(Ordering::Relaxed),
            extract_count: self.extract_count.load(Ordering::Relaxed),
            extract_ns: self.extract_ns.load(Ordering::Relaxed),
            extract_bytes: self.extract_bytes.load(Ordering::Relaxed),
            fd_cache_hits: self.fd_cache_hits.load(Ordering::Relaxed),
            fd_cache_misses: self.fd_cache_misses.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_hit_bytes: self.pool_hit_bytes.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            pool_miss_bytes: self.pool_miss_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one point in time; what a diagnostics layer would
/// serialize.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Archives currently open (gauge).
    pub archives_open: i64,
    /// Archives opened since construction.
    pub archives_opened: u64,
    /// Archives closed since construction.
    pub archives_closed: u64,
    /// Entry readers discarded and freshly opened, typically to satisfy a
    /// backward seek on compressed data.
    pub entries_reopened: u64,
    /// Entry-table scans performed.
    pub metadata_reads: u64,
    /// Total nanoseconds spent scanning entry tables.
    pub metadata_read_ns: u64,
    /// Entry read operations completed.
    pub extract_count: u64,
    /// Total nanoseconds spent reading entry data.
    pub extract_ns: u64,
    /// Total entry bytes handed to the transport.
    pub extract_bytes: u64,
    /// Descriptor-cache hits.
    pub fd_cache_hits: u64,
    /// Descriptor-cache misses.
    pub fd_cache_misses: u64,
    /// Stream reads served from a pooled buffer.
    pub pool_hits: u64,
    /// Bytes requested by pool-served reads.
    pub pool_hit_bytes: u64,
    /// Stream reads that outgrew the pooled buffers.
    pub pool_misses: u64,
    /// Bytes allocated for oversized reads.
    pub pool_miss_bytes: u64,
    /// Errors surfaced to the transport.
    pub errors: u64,
}
