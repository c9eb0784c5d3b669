//! Read-only filesystem core that mirrors a backing directory tree and
//! presents every `*.zip` file in it as a directory of the archive's
//! entries.
//!
//! Consumers traverse mirrored directories and descend into archives with
//! no awareness that an archive is involved: a `photos.zip` in the backing
//! tree shows up as a directory named `photos`, and the stored entries
//! below it read like ordinary files. Everything is immutable and
//! read-only (`0o555` directories, `0o444` files).
//!
//! The crate is the filesystem engine only. It implements the node model
//! and inode policy, directory enumeration and lookup (nested and flat
//! archive presentations), the reference-counted descriptor cache with TTL
//! and size eviction, entry readers with forward seeking and a
//! rewind-by-reopen fallback for compressed data, streaming read handles
//! backed by a buffer pool, and the metrics and error taxonomy those paths
//! exercise. The kernel transport, mount helper, and diagnostics surfaces
//! are external collaborators: a transport maps its requests onto
//! [`Node`] capabilities and translates [`FsError`] values with
//! [`FsError::errno`].
//!
//! Entry points: build a [`ZipFs`] over a backing directory, take
//! [`ZipFs::root`], and resolve nodes from there; or use [`ZipFs::walk`]
//! for an in-process depth-first traversal of the whole logical tree.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::archive::ArchiveReader;
pub use crate::archive::Compression;
pub use crate::archive::EntryInfo;
pub use crate::cancel::CancelToken;
pub use crate::entry::EntryReader;
pub use crate::errors::FsError;
pub use crate::errors::Result;
pub use crate::fs::ROOT_INO;
pub use crate::fs::WalkError;
pub use crate::fs::ZipFs;
pub use crate::metrics::Metrics;
pub use crate::metrics::MetricsSnapshot;
pub use crate::node::DirEntry;
pub use crate::node::DirNode;
pub use crate::node::FileAttr;
pub use crate::node::FileNode;
pub use crate::node::FileType;
pub use crate::node::MemFile;
pub use crate::node::MirrorDir;
pub use crate::node::Node;
pub use crate::node::OpenFlags;
pub use crate::node::OpenedFile;
pub use crate::node::StreamFile;
pub use crate::node::StreamHandle;
pub use crate::node::ZipDir;
pub use crate::options::Options;

mod archive;
mod bufpool;
mod cancel;
mod entry;
mod errors;
mod fdcache;
mod fs;
mod metrics;
mod node;
mod options;
mod semaphore;
mod zippath;
