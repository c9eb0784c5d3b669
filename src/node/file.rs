//! Archive entries presented as regular files, and the streaming read
//! handle.

use std::fmt;
use std::io;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use std::time::SystemTime;

use log::warn;
use parking_lot::Mutex;

use crate::archive::ArchiveReader;
use crate::entry::EntryReader;
use crate::errors::FsError;
use crate::errors::Result;
use crate::fs::FsCore;
use crate::metrics::Metrics;
use crate::node::FileAttr;
use crate::node::FileNode;
use crate::node::FileType;
use crate::node::OpenFlags;

/// Per-open state handed back from [`FileNode::open`].
#[derive(Debug)]
pub enum OpenedFile {
    /// The node serves whole-content reads itself; the transport slices
    /// the buffer returned by [`Node::read_all`](crate::Node::read_all).
    InMemory,
    /// Reads go through a dedicated streaming handle.
    Streaming(Arc<StreamHandle>),
}

/// An entry small enough to decompress in one shot per read request.
#[derive(Clone, Debug)]
pub struct MemFile {
    fs: Arc<FsCore>,
    ino: u64,
    archive_path: PathBuf,
    entry_path: String,
    size: u64,
    mtime: SystemTime,
}

impl MemFile {
    pub(crate) fn new(
        fs: Arc<FsCore>,
        ino: u64,
        archive_path: PathBuf,
        entry_path: String,
        size: u64,
        mtime: SystemTime,
    ) -> MemFile {
        assert_ne!(ino, 0, "inode zero is reserved");
        MemFile {
            fs,
            ino,
            archive_path,
            entry_path,
            size,
            mtime,
        }
    }

    /// Inode of this file.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Attributes: `file | 0o444`, entry size, entry mtime.
    pub fn attr(&self) -> FileAttr {
        FileAttr {
            ino: self.ino,
            size: self.size,
            kind: FileType::RegularFile,
            perm: 0o444,
            mtime: self.mtime,
        }
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.fs.metrics
    }

    /// Decompresses the whole entry into a fresh buffer. Empty entries
    /// yield an empty buffer. The archive reference and entry reader are
    /// released before returning, on success and failure alike.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let started = Instant::now();
        let (archive, mut reader) = self
            .fs
            .fd_cache
            .entry(&self.archive_path, &self.entry_path)?;
        let mut buf = Vec::with_capacity(usize::try_from(self.size).unwrap_or(0));
        let outcome = reader.read_to_end(&mut buf);
        reader.close();
        if let Err(err) = archive.release() {
            warn!("release of {} failed: {err}", self.archive_path.display());
        }
        match outcome {
            Ok(_) => {
                self.fs.metrics.extract(started.elapsed(), buf.len());
                Ok(buf)
            }
            Err(err) => {
                warn!(
                    "reading {} from {} failed: {err}",
                    self.entry_path,
                    self.archive_path.display()
                );
                Err(FsError::Io(err))
            }
        }
    }
}

impl FileNode for MemFile {
    fn open(&self) -> Result<(OpenedFile, OpenFlags)> {
        let flags = if self.fs.options.strict_cache {
            OpenFlags::empty()
        } else {
            OpenFlags::KEEP_CACHE
        };
        Ok((OpenedFile::InMemory, flags))
    }
}

/// An entry large enough to be served by incremental streaming reads.
#[derive(Clone, Debug)]
pub struct StreamFile {
    fs: Arc<FsCore>,
    ino: u64,
    archive_path: PathBuf,
    entry_path: String,
    size: u64,
    mtime: SystemTime,
}

impl StreamFile {
    pub(crate) fn new(
        fs: Arc<FsCore>,
        ino: u64,
        archive_path: PathBuf,
        entry_path: String,
        size: u64,
        mtime: SystemTime,
    ) -> StreamFile {
        assert_ne!(ino, 0, "inode zero is reserved");
        StreamFile {
            fs,
            ino,
            archive_path,
            entry_path,
            size,
            mtime,
        }
    }

    /// Inode of this file.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Attributes: `file | 0o444`, entry size, entry mtime.
    pub fn attr(&self) -> FileAttr {
        FileAttr {
            ino: self.ino,
            size: self.size,
            kind: FileType::RegularFile,
            perm: 0o444,
            mtime: self.mtime,
        }
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.fs.metrics
    }
}

impl FileNode for StreamFile {
    fn open(&self) -> Result<(OpenedFile, OpenFlags)> {
        let (archive, reader) = self
            .fs
            .fd_cache
            .entry(&self.archive_path, &self.entry_path)?;
        let flags = if self.fs.options.strict_cache {
            OpenFlags::empty()
        } else {
            OpenFlags::KEEP_CACHE
        };
        let handle = StreamHandle {
            fs: Arc::clone(&self.fs),
            archive,
            reader: Mutex::new(Some(reader)),
        };
        Ok((OpenedFile::Streaming(Arc::new(handle)), flags))
    }
}

/// State for one open streamed file: one archive reference and one entry
/// reader, with a mutex making the seek-then-read sequence atomic under
/// the concurrent requests a kernel issues against a single handle.
pub struct StreamHandle {
    fs: Arc<FsCore>,
    archive: Arc<ArchiveReader>,
    reader: Mutex<Option<EntryReader>>,
}

impl StreamHandle {
    /// Reads up to `size` bytes at `offset`, returning a fresh buffer the
    /// transport owns (pooled memory never escapes).
    ///
    /// A short (or empty) buffer means the range extends past the end of
    /// the entry. A backward read against a non-seekable entry reopens the
    /// reader from offset zero and retries once.
    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let result = self.read_locked(offset, size);
        if result.is_err() {
            self.fs.metrics.error();
        }
        result
    }

    fn read_locked(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock();
        let reader = guard
            .as_mut()
            .ok_or_else(|| FsError::Io(io::Error::new(io::ErrorKind::Other, "handle released")))?;

        if reader.position() != offset {
            match reader.forward_to(offset) {
                Ok(()) => {}
                Err(FsError::NonSeekableRewind) => {
                    let mut fresh = reader.reopen()?;
                    self.fs.metrics.entry_reopened();
                    fresh.forward_to(offset)?;
                    *reader = fresh;
                }
                Err(err) => return Err(err),
            }
        }

        let started = Instant::now();
        let mut buf = self.fs.pool.acquire(size);
        let filled = read_full(reader, &mut buf[..size]).map_err(FsError::Io)?;
        let out = buf[..filled].to_vec();
        drop(buf);
        self.fs.metrics.extract(started.elapsed(), filled);
        Ok(out)
    }

    /// Closes the entry reader and drops the archive reference. Reads
    /// after release fail. Idempotent; also runs on drop.
    pub fn release(&self) {
        if let Some(mut reader) = self.reader.lock().take() {
            reader.close();
            if let Err(err) = self.archive.release() {
                warn!(
                    "release of {} failed: {err}",
                    self.archive.path().display()
                );
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("archive", &self.archive.path())
            .field("released", &self.reader.lock().is_none())
            .finish()
    }
}

/// Fills `buf` from the reader; end-of-stream conditions produce a short
/// count, any other failure an error.
fn read_full(reader: &mut EntryReader, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
