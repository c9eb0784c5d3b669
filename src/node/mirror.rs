//! Mirrored backing directories. Only subdirectories and `.zip` files
//! show through; archives present as directories with the suffix
//! stripped.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use log::debug;

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
use crate::node::Node;
use crate::node::ZipDir;

/// A real directory of the backing tree.
#[derive(Clone, Debug)]
pub struct MirrorDir {
    fs: Arc<FsCore>,
    ino: u64,
    path: PathBuf,
    mtime: SystemTime,
}

impl MirrorDir {
    pub(crate) fn new(fs: Arc<FsCore>, ino: u64, path: PathBuf, mtime: SystemTime) -> MirrorDir {
        assert_ne!(ino, 0, "inode zero is reserved");
        MirrorDir {
            fs,
            ino,
            path,
            mtime,
        }
    }

    /// Inode of this directory.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Attributes: `dir | 0o555`, times from the backing mtime.
    pub fn attr(&self) -> FileAttr {
        FileAttr {
            ino: self.ino,
            size: 0,
            kind: FileType::Directory,
            perm: 0o555,
            mtime: self.mtime,
        }
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.fs.metrics
    }
}

impl DirNode for MirrorDir {
    fn readdir(&self, cancel: &CancelToken) -> Result<Vec<DirEntry>> {
        cancel.check()?;
        let mut names = BTreeSet::new();
        let mut zips = BTreeSet::new();
        for entry in fs::read_dir(&self.path)? {
            cancel.check()?;
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                debug!(
                    "skipping non-utf8 name {:?} in {}",
                    entry.file_name(),
                    self.path.display()
                );
                continue;
            };
            // follow symlinks, as lookup does; entries that fail to stat
            // are simply not presented
            let Ok(meta) = fs::metadata(entry.path()) else {
                debug!("skipping unstattable {}", entry.path().display());
                continue;
            };
            if meta.is_dir() {
                names.insert(name);
            } else if meta.is_file() {
                if let Some(stem) = name.strip_suffix(".zip") {
                    if !stem.is_empty() {
                        zips.insert(stem.to_owned());
                    }
                }
            }
        }
        // a bare subdirectory wins over a same-stemmed zip
        names.extend(zips);
        Ok(names
            .into_iter()
            .map(|name| DirEntry {
                ino: child_ino(self.ino, &name),
                kind: FileType::Directory,
                name,
            })
            .collect())
    }

    fn lookup(&self, name: &str, cancel: &CancelToken) -> Result<Node> {
        cancel.check()?;
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::NotFound(format!("{name:?} in {}", self.path.display())));
        }
        let path = self.path.join(name);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                let mtime = meta.modified()?;
                return Ok(Node::MirrorDir(MirrorDir::new(
                    Arc::clone(&self.fs),
                    child_ino(self.ino, name),
                    path,
                    mtime,
                )));
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let zip_path = self.path.join(format!("{name}.zip"));
        match fs::metadata(&zip_path) {
            Ok(meta) if meta.is_file() => {
                let mtime = meta.modified()?;
                Ok(Node::ZipDir(ZipDir::new(
                    Arc::clone(&self.fs),
                    child_ino(self.ino, name),
                    zip_path,
                    String::new(),
                    mtime,
                )))
            }
            Ok(_) => Err(FsError::NotFound(format!("{}", path.display()))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(FsError::NotFound(format!("{}", path.display())))
            }
            Err(err) => Err(err.into()),
        }
    }
}
