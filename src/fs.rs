//! Filesystem construction, inode derivation, and the synchronous walker.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use sha1::Digest;
use sha1::Sha1;

use crate::bufpool::BufferPool;
use crate::cancel::CancelToken;
use crate::errors::FsError;
use crate::errors::Result;
use crate::fdcache::FdCache;
use crate::metrics::Metrics;
use crate::node::DirEntry;
use crate::node::FileAttr;
use crate::node::MirrorDir;
use crate::node::Node;
use crate::options::Options;
use crate::semaphore::Semaphore;

/// Inode of the filesystem root.
pub const ROOT_INO: u64 = 1;

/// Derives the inode of a child from its parent inode and presented name.
///
/// The derivation is a stable digest, so independent instances over
/// identical trees assign identical inodes. Zero (reserved for transports
/// that generate their own inodes, which this core refuses to do) and the
/// root inode are never produced.
pub(crate) fn child_ino(parent: u64, name: &str) -> u64 {
    let mut salt = 0u8;
    loop {
        let mut hasher = Sha1::new();
        hasher.update(parent.to_le_bytes());
        hasher.update([salt]);
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        let mut eight = [0u8; 8];
        eight.copy_from_slice(&digest[..8]);
        let ino = u64::from_le_bytes(eight);
        if ino > ROOT_INO {
            return ino;
        }
        salt = salt.wrapping_add(1);
    }
}

/// Shared state behind every node: the backing root, the option block,
/// metrics, the descriptor cache, and the stream buffer pool.
pub(crate) struct FsCore {
    pub(crate) root: PathBuf,
    pub(crate) options: Arc<Options>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) fd_cache: FdCache,
    pub(crate) pool: BufferPool,
}

impl fmt::Debug for FsCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsCore")
            .field("root", &self.root)
            .field("fd_cache", &self.fd_cache)
            .finish()
    }
}

/// The filesystem: owns the option block, metrics, descriptor cache, and
/// buffer pool, and hands out nodes starting at [`ZipFs::root`].
#[derive(Clone, Debug)]
pub struct ZipFs {
    core: Arc<FsCore>,
}

impl ZipFs {
    /// Builds a filesystem over the backing directory `root`.
    ///
    /// Fails if `root` is empty or not a stat-able directory, or if the
    /// options are inconsistent.
    pub fn new(root: impl Into<PathBuf>, options: Options) -> Result<ZipFs> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(FsError::Invalid("empty root directory".to_owned()));
        }
        let meta = std::fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(FsError::Invalid(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        options.validate()?;
        let options = Arc::new(options);
        let metrics = Arc::new(Metrics::default());
        let sem = Semaphore::new(options.fd_limit);
        let fd_cache = FdCache::new(Arc::clone(&options), sem, Arc::clone(&metrics));
        let pool = BufferPool::new(options.stream_pool_size, Arc::clone(&metrics));
        Ok(ZipFs {
            core: Arc::new(FsCore {
                root,
                options,
                metrics,
                fd_cache,
                pool,
            }),
        })
    }

    /// The root node, inode [`ROOT_INO`].
    pub fn root(&self) -> Node {
        Node::MirrorDir(MirrorDir::new(
            Arc::clone(&self.core),
            ROOT_INO,
            self.core.root.clone(),
            SystemTime::now(),
        ))
    }

    /// The option block, including the runtime-mutable knobs.
    pub fn options(&self) -> &Options {
        &self.core.options
    }

    /// Activity counters for this instance.
    pub fn metrics(&self) -> &Metrics {
        &self.core.metrics
    }

    /// Prepares for unmount: stop caching new archive opens and drop all
    /// cached readers. Returns the previous cache-bypass state so the
    /// caller can restore it if the unmount is abandoned.
    pub fn prepare_unmount(&self) -> bool {
        self.core.fd_cache.halt_and_purge()
    }

    /// Stops background machinery and blocks until it has exited.
    pub fn shutdown(&self) {
        self.core.fd_cache.destroy();
    }

    /// Walks the whole logical tree depth first, invoking `visit` for
    /// every node with its logical path, the directory entry that
    /// produced it (absent for the root), the node, and its attributes.
    ///
    /// The walk checks `cancel` at every node. Failures carry the path at
    /// which they occurred.
    pub fn walk(
        &self,
        cancel: &CancelToken,
        visit: &mut dyn FnMut(&Path, Option<&DirEntry>, &Node, &FileAttr) -> Result<()>,
    ) -> std::result::Result<(), WalkError> {
        let root = self.root();
        walk_node(Path::new(""), None, &root, cancel, visit)
    }
}

/// Failure from a tree walk, carrying the logical path where it occurred.
#[derive(Debug, thiserror::Error)]
#[error("walk failed at {path:?}: {source}")]
pub struct WalkError {
    /// Logical path of the node that failed.
    pub path: PathBuf,
    /// The underlying failure.
    #[source]
    pub source: FsError,
}

fn walk_node(
    path: &Path,
    entry: Option<&DirEntry>,
    node: &Node,
    cancel: &CancelToken,
    visit: &mut dyn FnMut(&Path, Option<&DirEntry>, &Node, &FileAttr) -> Result<()>,
) -> std::result::Result<(), WalkError> {
    let here = |source| WalkError {
        path: path.to_path_buf(),
        source,
    };
    cancel.check().map_err(here)?;
    let attr = node.attr();
    visit(path, entry, node, &attr).map_err(here)?;
    if node.as_dir().is_none() {
        return Ok(());
    }
    for child_entry in node.readdir(cancel).map_err(here)? {
        let child_path = path.join(&child_entry.name);
        let child = node.lookup(&child_entry.name, cancel).map_err(|source| WalkError {
            path: child_path.clone(),
            source,
        })?;
        walk_node(&child_path, Some(&child_entry), &child, cancel, visit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inodes_are_deterministic() {
        let a = child_ino(ROOT_INO, "docs");
        let b = child_ino(ROOT_INO, "docs");
        assert_eq!(a, b);
        assert_ne!(a, 0);
        assert_ne!(a, ROOT_INO);
        assert_ne!(child_ino(ROOT_INO, "docs"), child_ino(ROOT_INO, "src"));
        assert_ne!(child_ino(2, "docs"), child_ino(3, "docs"));
    }

    #[test]
    fn construction_rejects_bad_roots() {
        assert!(ZipFs::new("", Options::default()).is_err());
        assert!(ZipFs::new("/definitely/not/there", Options::default()).is_err());

        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(ZipFs::new(&file, Options::default()).is_err());
    }

    #[test]
    fn construction_rejects_inconsistent_options() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut options = Options::default();
        options.fd_limit = 4;
        options.fd_cache_size = 4;
        assert!(ZipFs::new(dir.path(), options).is_err());
    }

    #[test]
    fn root_has_inode_one() {
        let dir = tempfile::TempDir::new().unwrap();
        let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
        let root = fs.root();
        assert_eq!(root.ino(), ROOT_INO);
        assert!(root.as_dir().is_some());
        fs.shutdown();
    }
}
