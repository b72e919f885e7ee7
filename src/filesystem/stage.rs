// src/filesystem/stage.rs

//! Copy-on-write staging filesystem with atomic multi-file commit
//!
//! The committed tree lives under `<dir>/tree`. The first write of a
//! transaction copies it to `<dir>/stage`; every operation from then on
//! addresses the staging copy. Commit is a directory swap
//! (`tree` -> `tree.old`, `stage` -> `tree`, remove `tree.old`), so a commit
//! is atomic across every file it touches; abort discards the staging copy.
//! An exclusive lock file serializes writers on the store directory.
//!
//! Interrupted swaps are repaired on open: a missing `tree` with a staging
//! copy still present rolls the commit forward, a missing `tree` with only
//! `tree.old` rolls it back.

use std::cell::Cell;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use fs2::FileExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::path;
use crate::error::{Error, Result};
use crate::txn::{ResourceManager, Txn};

/// Sort key for the filesystem resource manager
///
/// Compares greater than the session's key so the object tree stages its
/// writes before the swap happens.
pub(crate) const FS_SORT_KEY: &str = "larder.fs";

/// Staging filesystem rooted at a store directory
///
/// Cheap to clone; clones share the same staging state.
#[derive(Clone)]
pub struct StageFs {
    inner: Rc<StageInner>,
}

struct StageInner {
    /// Committed tree
    tree: PathBuf,
    /// Staging copy, present only while a transaction has written
    stage: PathBuf,
    /// Swap intermediate
    old: PathBuf,
    /// Exclusive lock on the store directory, held for the lifetime of the
    /// handle
    _lock: File,
    /// Whether the staging copy has been initialized this transaction
    staged: Cell<bool>,
}

impl StageFs {
    /// Open (creating if necessary) a store directory
    ///
    /// Acquires the single-writer lock and repairs any interrupted commit
    /// swap left behind by a crash.
    pub fn open(dir: impl AsRef<Path>) -> Result<StageFs> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(".lock"))?;
        lock.try_lock_exclusive().map_err(|_| {
            Error::Configuration(format!(
                "store directory {} is locked by another process",
                dir.display()
            ))
        })?;

        let tree = dir.join("tree");
        let stage = dir.join("stage");
        let old = dir.join("tree.old");

        if !tree.exists() && old.exists() {
            if stage.exists() {
                // Crashed between the two swap renames: roll forward
                fs::rename(&stage, &tree)?;
                fs::remove_dir_all(&old)?;
                warn!(dir = %dir.display(), "completed interrupted commit");
            } else {
                fs::rename(&old, &tree)?;
                warn!(dir = %dir.display(), "restored tree after interrupted commit");
            }
        } else {
            if old.exists() {
                // Commit landed but cleanup did not
                fs::remove_dir_all(&old)?;
            }
            if stage.exists() {
                // Stale staging copy from an aborted process
                fs::remove_dir_all(&stage)?;
                debug!(dir = %dir.display(), "discarded stale staging copy");
            }
        }
        if !tree.exists() {
            fs::create_dir_all(&tree)?;
        }

        Ok(StageFs {
            inner: Rc::new(StageInner {
                tree,
                stage,
                old,
                _lock: lock,
                staged: Cell::new(false),
            }),
        })
    }

    fn active_root(&self) -> &PathBuf {
        if self.inner.staged.get() {
            &self.inner.stage
        } else {
            &self.inner.tree
        }
    }

    fn resolve(&self, vpath: &str) -> Result<PathBuf> {
        let mut real = self.active_root().clone();
        for part in path::components(vpath)? {
            real.push(part);
        }
        Ok(real)
    }

    /// Copy the committed tree into the staging directory on first write
    fn ensure_stage(&self) -> Result<()> {
        if self.inner.staged.get() {
            return Ok(());
        }
        if self.inner.stage.exists() {
            fs::remove_dir_all(&self.inner.stage)?;
        }
        for entry in WalkDir::new(&self.inner.tree) {
            let entry = entry.map_err(|e| {
                Error::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other("walkdir error without io cause")
                }))
            })?;
            let rel = entry
                .path()
                .strip_prefix(&self.inner.tree)
                .unwrap_or(Path::new(""));
            let target = self.inner.stage.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }
        self.inner.staged.set(true);
        debug!(stage = %self.inner.stage.display(), "initialized staging copy");
        Ok(())
    }

    /// Whether a file or directory exists at the virtual path
    pub fn exists(&self, vpath: &str) -> bool {
        self.resolve(vpath).map(|p| p.exists()).unwrap_or(false)
    }

    /// Whether the virtual path names a directory
    pub fn isdir(&self, vpath: &str) -> bool {
        self.resolve(vpath).map(|p| p.is_dir()).unwrap_or(false)
    }

    /// List directory entry names, sorted
    pub fn listdir(&self, vpath: &str) -> Result<Vec<String>> {
        let real = self.resolve(vpath)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&real)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Read a file's contents
    pub fn read(&self, vpath: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(vpath)?)?)
    }

    /// Write a file, staging it; missing parent directories are created
    pub fn write(&self, vpath: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_stage()?;
        let real = self.resolve(vpath)?;
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&real, bytes)?;
        Ok(())
    }

    /// Create a directory (and any missing parents)
    pub fn mkdir(&self, vpath: &str) -> Result<()> {
        self.ensure_stage()?;
        fs::create_dir_all(self.resolve(vpath)?)?;
        Ok(())
    }

    /// Remove a file
    pub fn rm(&self, vpath: &str) -> Result<()> {
        self.ensure_stage()?;
        fs::remove_file(self.resolve(vpath)?)?;
        Ok(())
    }

    /// Remove a directory tree
    pub fn rmtree(&self, vpath: &str) -> Result<()> {
        self.ensure_stage()?;
        fs::remove_dir_all(self.resolve(vpath)?)?;
        Ok(())
    }

    /// Move a file or directory tree within the store
    pub fn mv(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_stage()?;
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        Ok(())
    }

    /// Join the given transaction as a resource manager
    pub(crate) fn join(&self, txn: &Txn) {
        txn.join(Rc::new(self.clone()));
    }
}

impl ResourceManager for StageFs {
    fn sort_key(&self) -> &str {
        FS_SORT_KEY
    }

    fn vote(&self, _txn: &Txn) -> Result<()> {
        Ok(())
    }

    fn finish(&self, _txn: &Txn) -> Result<()> {
        if !self.inner.staged.get() {
            return Ok(());
        }
        fs::rename(&self.inner.tree, &self.inner.old)?;
        fs::rename(&self.inner.stage, &self.inner.tree)?;
        fs::remove_dir_all(&self.inner.old)?;
        self.inner.staged.set(false);
        debug!(tree = %self.inner.tree.display(), "committed staged tree");
        Ok(())
    }

    fn abort(&self, _txn: &Txn) {
        if self.inner.staged.get() {
            if let Err(e) = fs::remove_dir_all(&self.inner.stage) {
                warn!(error = %e, "failed to discard staging copy");
            }
            self.inner.staged.set(false);
            debug!("discarded staged tree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::TxnManager;
    use tempfile::TempDir;

    fn committed(fs: &StageFs) {
        let txm = TxnManager::new();
        let txn = txm.current();
        fs.join(&txn);
        txm.commit().unwrap();
    }

    #[test]
    fn test_reads_fall_through_to_tree() {
        let dir = TempDir::new().unwrap();
        let fs = StageFs::open(dir.path()).unwrap();
        assert!(!fs.exists("/a.doc"));
        fs.write("/a.doc", b"one").unwrap();
        assert_eq!(fs.read("/a.doc").unwrap(), b"one");
    }

    #[test]
    fn test_commit_persists() {
        let dir = TempDir::new().unwrap();
        {
            let fs = StageFs::open(dir.path()).unwrap();
            fs.write("/a.doc", b"one").unwrap();
            fs.mkdir("/sub").unwrap();
            fs.write("/sub/b.doc", b"two").unwrap();
            committed(&fs);
        }
        let fs = StageFs::open(dir.path()).unwrap();
        assert_eq!(fs.read("/a.doc").unwrap(), b"one");
        assert_eq!(fs.read("/sub/b.doc").unwrap(), b"two");
        assert!(fs.isdir("/sub"));
    }

    #[test]
    fn test_abort_discards() {
        let dir = TempDir::new().unwrap();
        let fs = StageFs::open(dir.path()).unwrap();
        fs.write("/keep.doc", b"keep").unwrap();
        committed(&fs);

        fs.write("/drop.doc", b"drop").unwrap();
        let txm = TxnManager::new();
        let txn = txm.current();
        fs.join(&txn);
        txm.abort();

        assert!(fs.exists("/keep.doc"));
        assert!(!fs.exists("/drop.doc"));
    }

    #[test]
    fn test_staged_view_overlays_tree() {
        let dir = TempDir::new().unwrap();
        let fs = StageFs::open(dir.path()).unwrap();
        fs.write("/a.doc", b"one").unwrap();
        committed(&fs);

        fs.write("/a.doc", b"two").unwrap();
        assert_eq!(fs.read("/a.doc").unwrap(), b"two");
        fs.rm("/a.doc").unwrap();
        assert!(!fs.exists("/a.doc"));
    }

    #[test]
    fn test_mv_directory() {
        let dir = TempDir::new().unwrap();
        let fs = StageFs::open(dir.path()).unwrap();
        fs.mkdir("/bar").unwrap();
        fs.write("/bar/x.doc", b"x").unwrap();
        committed(&fs);

        fs.mv("/bar", "/foo").unwrap();
        assert!(!fs.exists("/bar"));
        assert_eq!(fs.read("/foo/x.doc").unwrap(), b"x");
        committed(&fs);
        assert!(!fs.exists("/bar"));
        assert_eq!(fs.read("/foo/x.doc").unwrap(), b"x");
    }

    #[test]
    fn test_listdir_sorted() {
        let dir = TempDir::new().unwrap();
        let fs = StageFs::open(dir.path()).unwrap();
        fs.write("/b.doc", b"b").unwrap();
        fs.write("/a.doc", b"a").unwrap();
        fs.mkdir("/c").unwrap();
        let names = fs.listdir("/").unwrap();
        assert_eq!(names, vec!["a.doc", "b.doc", "c"]);
    }

    #[test]
    fn test_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let fs = StageFs::open(dir.path()).unwrap();
        assert!(fs.read("/../escape").is_err());
        assert!(!fs.exists("/../escape"));
    }

    #[test]
    fn test_recovery_rolls_forward() {
        let dir = TempDir::new().unwrap();
        {
            let fs = StageFs::open(dir.path()).unwrap();
            fs.write("/a.doc", b"old").unwrap();
            committed(&fs);
        }
        // Simulate a crash between the two swap renames
        std::fs::rename(dir.path().join("tree"), dir.path().join("tree.old")).unwrap();
        std::fs::create_dir_all(dir.path().join("stage")).unwrap();
        std::fs::write(dir.path().join("stage/a.doc"), b"new").unwrap();

        let fs = StageFs::open(dir.path()).unwrap();
        assert_eq!(fs.read("/a.doc").unwrap(), b"new");
        assert!(!dir.path().join("tree.old").exists());
    }

    #[test]
    fn test_recovery_rolls_back() {
        let dir = TempDir::new().unwrap();
        {
            let fs = StageFs::open(dir.path()).unwrap();
            fs.write("/a.doc", b"old").unwrap();
            committed(&fs);
        }
        // Simulate a crash right after the first swap rename
        std::fs::rename(dir.path().join("tree"), dir.path().join("tree.old")).unwrap();

        let fs = StageFs::open(dir.path()).unwrap();
        assert_eq!(fs.read("/a.doc").unwrap(), b"old");
    }
}
