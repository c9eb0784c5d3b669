//! Readers over a single archive entry: raw seekable windows for stored
//! data, CRC-validating and decompressing streams for everything else.

use std::fmt;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use sync_file::ReadAt;
use sync_file::SyncFile;

use crate::archive::Compression;
use crate::archive::EntryInfo;
use crate::errors::FsError;
use crate::errors::Result;
use crate::options::Options;

/// Window over a byte range of the backing archive file.
///
/// Reads go through `read_at`, so windows sharing one descriptor do not
/// disturb each other's cursors.
pub(crate) struct SliceReader {
    file: SyncFile,
    start: u64,
    len: u64,
    pos: u64,
}

impl SliceReader {
    pub(crate) fn new(file: SyncFile, start: u64, len: u64) -> SliceReader {
        SliceReader {
            file,
            start,
            len,
            pos: 0,
        }
    }
}

impl Read for SliceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let read = self.file.read_at(&mut buf[..want], self.start + self.pos)?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for SliceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => i128::from(self.len) + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before window start",
            ));
        }
        self.pos = (target as u64).min(self.len);
        Ok(self.pos)
    }
}

impl fmt::Debug for SliceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceReader")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("pos", &self.pos)
            .finish()
    }
}

/// Validates the CRC-32 of the logical stream once it has been fully
/// consumed.
struct Crc32Reader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
    expected: u32,
    size: u64,
    consumed: u64,
    verified: bool,
}

impl<R> Crc32Reader<R> {
    fn new(inner: R, expected: u32, size: u64) -> Crc32Reader<R> {
        Crc32Reader {
            inner,
            hasher: crc32fast::Hasher::new(),
            expected,
            size,
            consumed: 0,
            verified: false,
        }
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read == 0 {
            if !buf.is_empty() && !self.verified && self.consumed == self.size {
                self.verified = true;
                if self.hasher.clone().finalize() != self.expected {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "crc32 mismatch",
                    ));
                }
            }
            return Ok(0);
        }
        self.hasher.update(&buf[..read]);
        self.consumed += read as u64;
        Ok(read)
    }
}

enum Stream {
    Raw(SliceReader),
    Checked(Crc32Reader<SliceReader>),
    Inflate(Crc32Reader<DeflateDecoder<SliceReader>>),
    Closed,
}

/// Reader over one opened entry. Positions are logical (decompressed)
/// bytes. Forward movement on a non-seekable stream discards into a sink;
/// backward movement reports [`FsError::NonSeekableRewind`] so the caller
/// can reopen from offset zero via [`EntryReader::reopen`].
pub struct EntryReader {
    file: SyncFile,
    info: EntryInfo,
    options: Arc<Options>,
    stream: Stream,
    pos: u64,
}

impl EntryReader {
    pub(crate) fn new(file: SyncFile, info: EntryInfo, options: Arc<Options>) -> Result<EntryReader> {
        let stream = Self::open_stream(&file, &info, &options)?;
        Ok(EntryReader {
            file,
            info,
            options,
            stream,
            pos: 0,
        })
    }

    fn open_stream(file: &SyncFile, info: &EntryInfo, options: &Options) -> Result<Stream> {
        match info.compression {
            Compression::Stored => {
                let slice = SliceReader::new(file.clone(), info.data_start, info.size);
                if options.must_crc32() {
                    Ok(Stream::Checked(Crc32Reader::new(slice, info.crc32, info.size)))
                } else {
                    Ok(Stream::Raw(slice))
                }
            }
            Compression::Deflated => {
                let slice = SliceReader::new(file.clone(), info.data_start, info.compressed_size);
                Ok(Stream::Inflate(Crc32Reader::new(
                    DeflateDecoder::new(slice),
                    info.crc32,
                    info.size,
                )))
            }
            Compression::Unsupported => Err(FsError::Invalid(format!(
                "unsupported compression for entry {}",
                info.path
            ))),
        }
    }

    /// The entry this reader serves.
    pub fn info(&self) -> &EntryInfo {
        &self.info
    }

    /// Logical bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Whether the underlying stream supports seeking.
    pub fn seekable(&self) -> bool {
        matches!(self.stream, Stream::Raw(_))
    }

    /// Moves the logical position to `offset`.
    ///
    /// Seekable streams seek. Non-seekable streams discard forward;
    /// running out of data during the discard is not an error. Moving
    /// backward on a non-seekable stream fails with
    /// [`FsError::NonSeekableRewind`] and does not advance.
    pub fn forward_to(&mut self, offset: u64) -> Result<()> {
        if offset == self.pos {
            return Ok(());
        }
        if let Stream::Raw(slice) = &mut self.stream {
            slice.seek(SeekFrom::Start(offset)).map_err(FsError::Io)?;
            self.pos = offset;
            return Ok(());
        }
        if matches!(self.stream, Stream::Closed) {
            return Err(FsError::Io(closed_error()));
        }
        if offset < self.pos {
            return Err(FsError::NonSeekableRewind);
        }
        let mut remaining = offset - self.pos;
        let mut scratch = [0u8; 8 * 1024];
        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            let read = self.read_stream(&mut scratch[..want]).map_err(FsError::Io)?;
            if read == 0 {
                break;
            }
            remaining -= read as u64;
        }
        self.pos = offset;
        Ok(())
    }

    /// Opens a fresh reader over the same entry, positioned at offset
    /// zero, without re-parsing the archive.
    pub fn reopen(&self) -> Result<EntryReader> {
        EntryReader::new(
            self.file.clone(),
            self.info.clone(),
            Arc::clone(&self.options),
        )
    }

    /// Drops the underlying stream. Further reads fail.
    pub fn close(&mut self) {
        self.stream = Stream::Closed;
    }

    fn read_stream(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Raw(reader) => reader.read(buf),
            Stream::Checked(reader) => reader.read(buf),
            Stream::Inflate(reader) => reader.read(buf),
            Stream::Closed => Err(closed_error()),
        }
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.read_stream(buf)?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryReader")
            .field("entry", &self.info.path)
            .field("pos", &self.pos)
            .field("seekable", &self.seekable())
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "entry reader is closed")
}
