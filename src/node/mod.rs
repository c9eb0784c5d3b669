//! The four node kinds of the presented tree, their capability traits,
//! and the shared attribute types.

mod file;
mod mirror;
mod zipdir;

pub use file::MemFile;
pub use file::OpenedFile;
pub use file::StreamFile;
pub use file::StreamHandle;
pub use mirror::MirrorDir;
pub use zipdir::ZipDir;

use std::time::SystemTime;

use crate::cancel::CancelToken;
use crate::errors::FsError;
use crate::errors::Result;
use crate::metrics::Metrics;

bitflags::bitflags! {
    /// Kernel caching hints returned from open calls.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Keep previously cached data for this node across opens.
        const KEEP_CACHE = 1 << 0;
        /// Cache the directory listing for this handle.
        const CACHE_DIR = 1 << 1;
    }
}

/// Kind of a presented node. Only directories and regular files exist on
/// this filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Directory (`S_IFDIR`).
    Directory,
    /// Regular file (`S_IFREG`).
    RegularFile,
}

/// Attributes reported for one node.
///
/// The filesystem is immutable, so access, change, and modification times
/// are all equal to `mtime`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttr {
    /// Inode number. Assigned by the core; never zero.
    pub ino: u64,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// Node kind.
    pub kind: FileType,
    /// Permission bits: `0o555` for directories, `0o444` for files.
    pub perm: u16,
    /// Modification time, also reported as atime and ctime.
    pub mtime: SystemTime,
}

/// One directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Presented name.
    pub name: String,
    /// Entry kind.
    pub kind: FileType,
    /// Child inode, derived from the parent inode and the name.
    pub ino: u64,
}

/// Directory capabilities: enumeration and name resolution.
pub trait DirNode {
    /// Lists every entry in presentation order.
    fn readdir(&self, cancel: &CancelToken) -> Result<Vec<DirEntry>>;

    /// Resolves one child by presented name.
    fn lookup(&self, name: &str, cancel: &CancelToken) -> Result<Node>;
}

/// File capabilities: opening for reads.
pub trait FileNode {
    /// Opens the file, returning the per-open state and caching hints.
    fn open(&self) -> Result<(OpenedFile, OpenFlags)>;
}

/// A node in the presented tree.
///
/// Each variant implements only the capabilities its kind supports;
/// [`Node::as_dir`] and [`Node::as_file`] expose them.
#[derive(Clone, Debug)]
pub enum Node {
    /// A mirrored backing directory.
    MirrorDir(MirrorDir),
    /// An archive, or a directory within one.
    ZipDir(ZipDir),
    /// An archive entry served from memory in one shot.
    MemFile(MemFile),
    /// An archive entry served by streaming reads.
    StreamFile(StreamFile),
}

impl Node {
    /// Inode of this node.
    pub fn ino(&self) -> u64 {
        match self {
            Node::MirrorDir(node) => node.ino(),
            Node::ZipDir(node) => node.ino(),
            Node::MemFile(node) => node.ino(),
            Node::StreamFile(node) => node.ino(),
        }
    }

    /// Attributes of this node.
    pub fn attr(&self) -> FileAttr {
        match self {
            Node::MirrorDir(node) => node.attr(),
            Node::ZipDir(node) => node.attr(),
            Node::MemFile(node) => node.attr(),
            Node::StreamFile(node) => node.attr(),
        }
    }

    /// Directory view of this node, when it is a directory.
    pub fn as_dir(&self) -> Option<&dyn DirNode> {
        match self {
            Node::MirrorDir(node) => Some(node),
            Node::ZipDir(node) => Some(node),
            Node::MemFile(_) | Node::StreamFile(_) => None,
        }
    }

    /// File view of this node, when it is a regular file.
    pub fn as_file(&self) -> Option<&dyn FileNode> {
        match self {
            Node::MirrorDir(_) | Node::ZipDir(_) => None,
            Node::MemFile(node) => Some(node),
            Node::StreamFile(node) => Some(node),
        }
    }

    /// Lists the entries of this directory.
    pub fn readdir(&self, cancel: &CancelToken) -> Result<Vec<DirEntry>> {
        let result = match self.as_dir() {
            Some(dir) => dir.readdir(cancel),
            None => Err(FsError::Invalid("not a directory".to_owned())),
        };
        self.observe(result)
    }

    /// Resolves one child of this directory.
    pub fn lookup(&self, name: &str, cancel: &CancelToken) -> Result<Node> {
        let result = match self.as_dir() {
            Some(dir) => dir.lookup(name, cancel),
            None => Err(FsError::Invalid("not a directory".to_owned())),
        };
        self.observe(result)
    }

    /// Opens this regular file.
    pub fn open(&self) -> Result<(OpenedFile, OpenFlags)> {
        let result = match self.as_file() {
            Some(file) => file.open(),
            None => Err(FsError::Invalid("not a regular file".to_owned())),
        };
        self.observe(result)
    }

    /// Caching hints for opening this node as a directory.
    pub fn opendir_flags(&self) -> OpenFlags {
        match self {
            Node::ZipDir(node) => node.open_flags(),
            _ => OpenFlags::empty(),
        }
    }

    /// Reads the whole decompressed contents of an in-memory file node.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let result = match self {
            Node::MemFile(node) => node.read_all(),
            _ => Err(FsError::Invalid(
                "whole-content reads need an in-memory file".to_owned(),
            )),
        };
        self.observe(result)
    }

    fn metrics(&self) -> &Metrics {
        match self {
            Node::MirrorDir(node) => node.metrics(),
            Node::ZipDir(node) => node.metrics(),
            Node::MemFile(node) => node.metrics(),
            Node::StreamFile(node) => node.metrics(),
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.metrics().error();
        }
        result
    }
}
