//! Archives presented as directories, in nested or flat mode.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;

use crate::archive::ArchiveReader;
use crate::archive::EntryInfo;
use crate::cancel::CancelToken;
use crate::errors::FsError;
use crate::errors::Result;
use crate::fs::FsCore;
use crate::fs::child_ino;
use crate::metrics::Metrics;
use crate::node::DirEntry;
use crate::node::DirNode;
use crate::node::FileAttr;
use crate::node::FileType;
use crate::node::MemFile;
use crate::node::Node;
use crate::node::OpenFlags;
use crate::node::StreamFile;
use crate::zippath;

/// One ZIP archive (or a directory within one) presented as a directory.
///
/// An empty prefix denotes the archive root; otherwise the prefix names a
/// subtree and ends with `/`. The presentation mode (nested or flat) is
/// fixed at mount time by the option block.
#[derive(Clone, Debug)]
pub struct ZipDir {
    fs: Arc<FsCore>,
    ino: u64,
    archive_path: PathBuf,
    prefix: String,
    mtime: SystemTime,
}

impl ZipDir {
    pub(crate) fn new(
        fs: Arc<FsCore>,
        ino: u64,
        archive_path: PathBuf,
        prefix: String,
        mtime: SystemTime,
    ) -> ZipDir {
        assert_ne!(ino, 0, "inode zero is reserved");
        debug_assert!(prefix.is_empty() || prefix.ends_with('/'));
        ZipDir {
            fs,
            ino,
            archive_path,
            prefix,
            mtime,
        }
    }

    /// Inode of this directory.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Attributes: `dir | 0o555`, all times from the archive file's
    /// mtime. Subdirectories inside an archive bear the archive's mtime
    /// whether they come from explicit markers or are implied by entry
    /// paths.
    pub fn attr(&self) -> FileAttr {
        FileAttr {
            ino: self.ino,
            size: 0,
            kind: FileType::Directory,
            perm: 0o555,
            mtime: self.mtime,
        }
    }

    /// Caching hints for opening this directory: the archive is immutable
    /// once presented, so directory and data caches are kept unless
    /// strict-cache mode is on.
    pub fn open_flags(&self) -> OpenFlags {
        if self.fs.options.strict_cache {
            OpenFlags::empty()
        } else {
            OpenFlags::KEEP_CACHE | OpenFlags::CACHE_DIR
        }
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.fs.metrics
    }

    fn readdir_nested(
        &self,
        archive: &ArchiveReader,
        cancel: &CancelToken,
    ) -> Result<Vec<DirEntry>> {
        let mut dirs = BTreeSet::new();
        let mut files = BTreeSet::new();
        for entry in archive.entries() {
            cancel.check()?;
            let Some(rel) = entry.path.strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            match rel.split_once('/') {
                None if !entry.is_dir => {
                    files.insert(rel.to_owned());
                }
                None => {
                    dirs.insert(rel.to_owned());
                }
                Some((first, _)) if !first.is_empty() => {
                    dirs.insert(first.to_owned());
                }
                Some(_) => {}
            }
        }
        for name in &dirs {
            files.remove(name);
        }
        let mut out = Vec::with_capacity(dirs.len() + files.len());
        out.extend(dirs.into_iter().map(|name| DirEntry {
            ino: child_ino(self.ino, &name),
            kind: FileType::Directory,
            name,
        }));
        out.extend(files.into_iter().map(|name| DirEntry {
            ino: child_ino(self.ino, &name),
            kind: FileType::RegularFile,
            name,
        }));
        Ok(out)
    }

    fn readdir_flat(&self, archive: &ArchiveReader, cancel: &CancelToken) -> Result<Vec<DirEntry>> {
        let mut names = BTreeSet::new();
        for entry in archive.entries() {
            cancel.check()?;
            if entry.is_dir {
                continue;
            }
            let Some(name) = zippath::flat_name(entry.ordinal, &entry.path) else {
                warn!(
                    "not presenting entry {:?} of {}",
                    entry.path,
                    self.archive_path.display()
                );
                continue;
            };
            names.insert(name);
        }
        Ok(names
            .into_iter()
            .map(|name| DirEntry {
                ino: child_ino(self.ino, &name),
                kind: FileType::RegularFile,
                name,
            })
            .collect())
    }

    fn lookup_nested(&self, archive: &ArchiveReader, name: &str) -> Result<Node> {
        let full = format!("{}{name}", self.prefix);
        let dir_prefix = format!("{full}/");
        for entry in archive.entries() {
            if entry.path == full && !entry.is_dir {
                return Ok(self.file_node(name, entry));
            }
            if entry.path.starts_with(&dir_prefix) || (entry.path == full && entry.is_dir) {
                return Ok(Node::ZipDir(ZipDir::new(
                    Arc::clone(&self.fs),
                    child_ino(self.ino, name),
                    self.archive_path.clone(),
                    dir_prefix,
                    self.mtime,
                )));
            }
        }
        Err(FsError::NotFound(format!(
            "{}: no entry {full}",
            self.archive_path.display()
        )))
    }

    fn lookup_flat(&self, archive: &ArchiveReader, name: &str) -> Result<Node> {
        for entry in archive.entries() {
            if entry.is_dir {
                continue;
            }
            if zippath::flat_name(entry.ordinal, &entry.path).is_some_and(|flat| flat == name) {
                return Ok(self.file_node(name, entry));
            }
        }
        Err(FsError::NotFound(format!(
            "{}: no flat entry {name}",
            self.archive_path.display()
        )))
    }

    fn file_node(&self, name: &str, entry: &EntryInfo) -> Node {
        let ino = child_ino(self.ino, name);
        if entry.size > self.fs.options.stream_threshold() {
            Node::StreamFile(StreamFile::new(
                Arc::clone(&self.fs),
                ino,
                self.archive_path.clone(),
                entry.path.clone(),
                entry.size,
                entry.mtime,
            ))
        } else {
            Node::MemFile(MemFile::new(
                Arc::clone(&self.fs),
                ino,
                self.archive_path.clone(),
                entry.path.clone(),
                entry.size,
                entry.mtime,
            ))
        }
    }

    fn release(&self, archive: &Arc<ArchiveReader>) {
        if let Err(err) = archive.release() {
            warn!("release of {} failed: {err}", self.archive_path.display());
        }
    }
}

impl DirNode for ZipDir {
    fn readdir(&self, cancel: &CancelToken) -> Result<Vec<DirEntry>> {
        cancel.check()?;
        let archive = self.fs.fd_cache.archive(&self.archive_path)?;
        let result = if self.fs.options.flatten_zips {
            self.readdir_flat(&archive, cancel)
        } else {
            self.readdir_nested(&archive, cancel)
        };
        self.release(&archive);
        result
    }

    fn lookup(&self, name: &str, cancel: &CancelToken) -> Result<Node> {
        cancel.check()?;
        let archive = self.fs.fd_cache.archive(&self.archive_path)?;
        let result = if self.fs.options.flatten_zips {
            self.lookup_flat(&archive, name)
        } else {
            self.lookup_nested(&archive, name)
        };
        self.release(&archive);
        result
    }
}
