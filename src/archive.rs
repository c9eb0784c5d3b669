//! Reference-counted archive readers with a parsed entry snapshot.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use chrono::NaiveDate;
use log::debug;
use log::warn;
use parking_lot::Mutex;
use sync_file::SyncFile;

use crate::entry::EntryReader;
use crate::errors::FsError;
use crate::errors::Result;
use crate::metrics::Metrics;
use crate::options::Options;
use crate::semaphore::Semaphore;
use crate::semaphore::SemaphorePermit;
use crate::zippath;

/// Compression scheme of one stored entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    /// No compression; the entry data is a plain byte range.
    Stored,
    /// DEFLATE compression.
    Deflated,
    /// Any scheme this filesystem does not read.
    Unsupported,
}

/// Snapshot of one entry from an archive's central directory.
#[derive(Clone, Debug)]
pub struct EntryInfo {
    /// 1-based position of the entry within the archive.
    pub ordinal: usize,
    /// Presented path: normalized, Unicode-repaired.
    pub path: String,
    /// Whether the entry is a directory marker.
    pub is_dir: bool,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Compressed size in bytes.
    pub compressed_size: u64,
    /// CRC-32 of the uncompressed contents.
    pub crc32: u32,
    /// Compression scheme.
    pub compression: Compression,
    /// Entry modification time; the archive file's mtime when the entry
    /// carries none.
    pub mtime: SystemTime,
    /// Offset of the entry's data within the archive file.
    pub data_start: u64,
}

struct ArchiveInner {
    file: SyncFile,
    _permit: SemaphorePermit,
}

/// One opened ZIP archive, shared between nodes and handles.
///
/// The reader is reference counted: the descriptor cache owns one
/// reference per cached entry and every other borrower holds its own.
/// The backing descriptor closes exactly when the count reaches zero.
/// There is no direct close operation.
pub struct ArchiveReader {
    path: PathBuf,
    mtime: SystemTime,
    entries: Vec<EntryInfo>,
    refs: AtomicI64,
    inner: Mutex<Option<ArchiveInner>>,
    options: Arc<Options>,
    metrics: Arc<Metrics>,
}

impl ArchiveReader {
    /// Opens `path`, parses its central directory, and returns a reader
    /// holding one reference for the caller. Blocks until a descriptor
    /// permit is free.
    pub(crate) fn open(
        path: &Path,
        sem: &Arc<Semaphore>,
        options: Arc<Options>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<ArchiveReader>> {
        let permit = sem.acquire();
        let (file, mtime, entries) = Self::parse(path, &options)?;
        metrics.archive_opened();
        debug!("opened archive {} ({} entries)", path.display(), entries.len());
        Ok(Arc::new(ArchiveReader {
            path: path.to_path_buf(),
            mtime,
            entries,
            refs: AtomicI64::new(1),
            inner: Mutex::new(Some(ArchiveInner {
                file,
                _permit: permit,
            })),
            options,
            metrics,
        }))
    }

    fn parse(path: &Path, options: &Options) -> Result<(SyncFile, SystemTime, Vec<EntryInfo>)> {
        let file = SyncFile::open(path)?;
        let mtime = std::fs::metadata(path)?.modified()?;
        let mut parser = zip::ZipArchive::new(file.clone())
            .map_err(|err| FsError::Invalid(format!("{}: {err}", path.display())))?;
        let mut entries = Vec::with_capacity(parser.len());
        for index in 0..parser.len() {
            let entry = parser
                .by_index_raw(index)
                .map_err(|err| FsError::Invalid(format!("{}: {err}", path.display())))?;
            let ordinal = index + 1;
            let extra = entry.extra_data().map(|data| data.to_vec()).unwrap_or_default();
            let presented =
                zippath::presented_name(entry.name_raw(), &extra, ordinal, options.force_unicode);
            let mode_is_dir = entry.is_dir()
                || entry
                    .unix_mode()
                    .is_some_and(|mode| mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32);
            let is_dir = zippath::is_directory(mode_is_dir, &presented);
            let compression = match entry.compression() {
                zip::CompressionMethod::Stored => Compression::Stored,
                zip::CompressionMethod::Deflated => Compression::Deflated,
                _ => Compression::Unsupported,
            };
            let entry_mtime = entry
                .last_modified()
                .and_then(dos_time_to_system)
                .unwrap_or(mtime);
            entries.push(EntryInfo {
                ordinal,
                path: presented,
                is_dir,
                size: entry.size(),
                compressed_size: entry.compressed_size(),
                crc32: entry.crc32(),
                compression,
                mtime: entry_mtime,
                data_start: entry.data_start(),
            });
        }
        Ok((file, mtime, entries))
    }

    /// Backing archive path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time of the archive file.
    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// The parsed entry snapshot, in stored order.
    pub fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    /// Finds an entry by presented path.
    pub fn find_entry(&self, path: &str) -> Option<&EntryInfo> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    /// Takes an additional reference for the caller.
    pub fn acquire(&self) {
        let previous = self.refs.fetch_add(1, Ordering::SeqCst);
        assert!(
            previous > 0,
            "acquire on closed archive reader {}",
            self.path.display()
        );
    }

    /// Drops one reference. The last release closes the backing
    /// descriptor and frees its permit; releasing again afterwards
    /// reports [`FsError::AlreadyClosed`].
    pub fn release(&self) -> Result<()> {
        let previous = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| {
                if refs > 0 { Some(refs - 1) } else { None }
            })
            .map_err(|_| FsError::AlreadyClosed)?;
        if previous == 1 {
            self.close();
        }
        Ok(())
    }

    /// Opens a reader over the entry at `ordinal`.
    pub fn open_entry(&self, ordinal: usize) -> Result<EntryReader> {
        let info = self
            .entries
            .get(ordinal.wrapping_sub(1))
            .ok_or_else(|| {
                FsError::NotFound(format!("{}: no entry #{ordinal}", self.path.display()))
            })?
            .clone();
        let file = {
            let inner = self.inner.lock();
            let inner = inner.as_ref().ok_or(FsError::AlreadyClosed)?;
            inner.file.clone()
        };
        EntryReader::new(file, info, Arc::clone(&self.options))
    }

    pub(crate) fn refs(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let inner = self.inner.lock().take();
        assert!(
            inner.is_some(),
            "archive {} closed twice",
            self.path.display()
        );
        self.metrics.archive_closed();
        debug!("closed archive {}", self.path.display());
    }
}

impl Drop for ArchiveReader {
    fn drop(&mut self) {
        let leaked = self.refs.load(Ordering::SeqCst);
        if self.inner.get_mut().take().is_some() {
            warn!(
                "archive {} dropped with {leaked} outstanding references",
                self.path.display()
            );
            self.metrics.archive_closed();
        }
    }
}

impl fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .field("refs", &self.refs())
            .finish()
    }
}

fn dos_time_to_system(datetime: zip::DateTime) -> Option<SystemTime> {
    let date = NaiveDate::from_ymd_opt(
        i32::from(datetime.year()),
        u32::from(datetime.month()),
        u32::from(datetime.day()),
    )?;
    let time = date.and_hms_opt(
        u32::from(datetime.hour()),
        u32::from(datetime.minute()),
        u32::from(datetime.second()),
    )?;
    let stamp = time.and_utc().timestamp();
    u64::try_from(stamp)
        .ok()
        .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}
