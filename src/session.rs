// src/session.rs

//! Per-transaction mutation tracker
//!
//! A session binds one in-memory object tree to one transaction. It
//! materializes the tree from disk lazily, keeps object identity (one cell
//! per document per session), and on `vote` performs a rooted depth-first
//! save that writes only what changed: dirty documents are rewritten,
//! relocated subtrees are moved, deleted entries are removed.
//!
//! The session is a resource manager in the two-phase commit; its sort key
//! compares less than the staging filesystem's, so the tree stages its
//! writes before the filesystem swaps them in. After `finish` or `abort`
//! the session is closed and the store makes a fresh one for the next
//! transaction.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::doc;
use crate::error::{Error, Result};
use crate::filesystem::StageFs;
use crate::model::{attach, FolderEntry, Model, SessionRef};
use crate::store::StoreInner;
use crate::txn::{ResourceManager, Txn};

/// Sort key for the session resource manager; a strict prefix of the
/// filesystem's key, so it always sorts first
pub(crate) const SESSION_SORT_KEY: &str = "larder";

enum RootSlot {
    NotCached,
    Cached(Model),
}

pub(crate) struct SessionInner {
    pub(crate) store: Weak<StoreInner>,
    pub(crate) fs: StageFs,
    root: RefCell<RootSlot>,
    closed: Cell<bool>,
}

/// A removal discovered during the save traversal, executed after it
///
/// Deferred so that subtree relocations never race the removal of their
/// source ancestors; only final filesystem state is observable.
struct PendingRemoval {
    folder: Model,
    name: String,
    path: Option<String>,
    file: Option<String>,
    is_folder: bool,
}

impl SessionInner {
    pub(crate) fn new(store: Weak<StoreInner>, fs: StageFs) -> Self {
        SessionInner {
            store,
            fs,
            root: RefCell::new(RootSlot::NotCached),
            closed: Cell::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.get() {
            return Err(Error::Configuration(
                "session is closed; the transaction has ended".to_string(),
            ));
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.set(true);
        *self.root.borrow_mut() = RootSlot::NotCached;
    }

    /// Load one document and bind the object into this session
    pub(crate) fn load(
        self: &Rc<Self>,
        path: &str,
        file: &str,
        parent: Option<&Model>,
        name: Option<&str>,
    ) -> Result<Model> {
        self.check_open()?;
        let bytes = self.fs.read(file).map_err(|e| Error::Load {
            file: file.to_string(),
            reason: e.to_string(),
        })?;
        let obj = doc::decode(file, &bytes)?;
        {
            let mut st = obj.state_mut();
            st.session = SessionRef::Live(Rc::downgrade(self));
            st.path = Some(path.to_string());
            st.file = Some(file.to_string());
            st.parent = parent.map(Model::downgrade);
            st.name = name.map(str::to_string);
        }
        debug!(file, "loaded document");
        Ok(obj)
    }

    /// The root object, loading it or constructing it via `factory`
    ///
    /// Identity: within one session this returns the same object every time.
    pub(crate) fn get_root(self: &Rc<Self>, factory: &dyn Fn() -> Model) -> Result<Model> {
        self.check_open()?;
        if let RootSlot::Cached(root) = &*self.root.borrow() {
            return Ok(root.clone());
        }
        let file = doc::doc_file("/", true);
        if self.fs.exists(&file) {
            let root = self.load("/", &file, None, None)?;
            *self.root.borrow_mut() = RootSlot::Cached(root.clone());
            Ok(root)
        } else {
            let root = factory();
            self.set_root(root.clone())?;
            Ok(root)
        }
    }

    /// Install `root` as the transaction's root, replacing any cached one
    pub(crate) fn set_root(self: &Rc<Self>, root: Model) -> Result<()> {
        self.check_open()?;
        {
            let st = root.state();
            if let SessionRef::Live(_) = st.session {
                return Err(Error::AlreadyAttached {
                    path: st.path.clone().unwrap_or_default(),
                });
            }
        }
        {
            let mut st = root.state_mut();
            st.session = SessionRef::Live(Rc::downgrade(self));
            st.path = Some("/".to_string());
            st.file = Some(doc::doc_file("/", true));
            st.parent = None;
            st.name = None;
        }
        // A pre-assembled tree attaches as a whole
        if root.is_folder() {
            let names: Vec<String> = root
                .state()
                .contents
                .as_ref()
                .map(|c| c.keys().cloned().collect())
                .unwrap_or_default();
            for name in &names {
                attach(&root, name)?;
            }
        }
        *self.root.borrow_mut() = RootSlot::Cached(root.clone());
        root.mark_dirty();
        Ok(())
    }

    /// Write every change to the staging filesystem
    ///
    /// Equivalent to the save phase of a vote; idempotent, so calling it
    /// again without further mutations writes nothing.
    pub(crate) fn flush(&self) -> Result<()> {
        self.check_open()?;
        let root = match &*self.root.borrow() {
            RootSlot::Cached(root) => root.clone(),
            RootSlot::NotCached => return Ok(()),
        };
        let (dirty, dirty_children) = {
            let st = root.state();
            (st.dirty, st.dirty_children)
        };
        if !(dirty || dirty_children) {
            return Ok(());
        }
        let mut removals = Vec::new();
        self.save(&root, &mut removals)?;
        for removal in removals {
            if removal.is_folder {
                if let Some(path) = &removal.path {
                    if self.fs.exists(path) {
                        self.fs.rmtree(path)?;
                    }
                }
            } else if let Some(file) = &removal.file {
                if self.fs.exists(file) {
                    self.fs.rm(file)?;
                }
            }
            let mut st = removal.folder.state_mut();
            if let Some(contents) = st.contents.as_mut() {
                contents.shift_remove(&removal.name);
            }
            debug!(name = %removal.name, "removed deleted entry");
        }
        Ok(())
    }

    /// Depth-first save of one subtree
    fn save(&self, obj: &Model, removals: &mut Vec<PendingRemoval>) -> Result<()> {
        let (dirty, relocated, path, file, is_folder) = {
            let st = obj.state();
            (
                st.dirty,
                st.detached_from.is_some(),
                st.path.clone(),
                st.file.clone(),
                obj.is_folder(),
            )
        };
        let path = path.ok_or_else(|| {
            Error::Configuration("cannot save a model that has no path".to_string())
        })?;
        let file = file.ok_or_else(|| {
            Error::Configuration("cannot save a model that has no document file".to_string())
        })?;

        if dirty || relocated {
            if is_folder {
                self.fs.mkdir(&path)?;
            }
            let text = doc::encode(obj)?;
            self.fs.write(&file, text.as_bytes())?;
            debug!(%file, "wrote document");
            let mut st = obj.state_mut();
            st.dirty = false;
            st.detached_from = None;
        }

        if is_folder {
            let names: Vec<String> = obj
                .state()
                .contents
                .as_ref()
                .map(|c| c.keys().cloned().collect())
                .unwrap_or_default();
            for name in names {
                self.save_entry(obj, &name, removals)?;
            }
            obj.state_mut().dirty_children = false;
        }
        Ok(())
    }

    /// Process one folder entry during the save traversal
    fn save_entry(
        &self,
        folder: &Model,
        name: &str,
        removals: &mut Vec<PendingRemoval>,
    ) -> Result<()> {
        struct Snapshot {
            deleted: bool,
            loaded: Option<Model>,
            path: Option<String>,
            file: Option<String>,
            is_folder: bool,
            detached_from: Option<String>,
            replaces: Option<Box<FolderEntry>>,
        }
        let snap = {
            let mut st = folder.state_mut();
            let Some(entry) = st.contents.as_mut().and_then(|c| c.get_mut(name)) else {
                return Ok(());
            };
            Snapshot {
                deleted: entry.deleted,
                loaded: entry.loaded.clone(),
                path: entry.path.clone(),
                file: entry.file.clone(),
                is_folder: entry.is_folder,
                detached_from: entry.detached_from.clone(),
                replaces: entry.replaces.take(),
            }
        };

        if snap.deleted {
            removals.push(PendingRemoval {
                folder: folder.clone(),
                name: name.to_string(),
                path: snap.path,
                file: snap.file,
                is_folder: snap.is_folder,
            });
            return Ok(());
        }

        if let Some(child) = snap.loaded {
            // A displaced sibling loses its on-disk footprint right before
            // the overwriting write, so same-name swaps never lose data
            if let Some(prev) = snap.replaces {
                self.remove_entry_footprint(&prev)?;
            }
            let (c_dirty, c_dirty_children, c_relocated) = {
                let st = child.state();
                (st.dirty, st.dirty_children, st.detached_from.is_some())
            };
            if c_relocated || c_dirty || c_dirty_children {
                self.save(&child, removals)?;
            }
            return Ok(());
        }

        // Unloaded but relocated: move the bytes
        if let Some(origin) = snap.detached_from {
            let target_path = snap.path.ok_or_else(|| {
                Error::Configuration(format!("relocated child '{name}' has no path"))
            })?;
            let (from, to) = if snap.is_folder {
                (origin, target_path)
            } else {
                (
                    format!("{origin}{}", doc::DOC_SUFFIX),
                    format!("{target_path}{}", doc::DOC_SUFFIX),
                )
            };
            self.fs.mv(&from, &to)?;
            debug!(%from, %to, "moved relocated subtree");
            let mut st = folder.state_mut();
            if let Some(entry) = st.contents.as_mut().and_then(|c| c.get_mut(name)) {
                entry.detached_from = None;
            }
        }
        Ok(())
    }

    fn remove_entry_footprint(&self, entry: &FolderEntry) -> Result<()> {
        if entry.is_folder {
            if let Some(path) = &entry.path {
                if self.fs.exists(path) {
                    self.fs.rmtree(path)?;
                }
            }
        } else if let Some(file) = &entry.file {
            if self.fs.exists(file) {
                self.fs.rm(file)?;
            }
        }
        Ok(())
    }
}

/// Handle to the current transaction's session
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Rc<SessionInner>,
}

impl Session {
    /// Whether this session's transaction has ended
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl ResourceManager for Session {
    fn sort_key(&self) -> &str {
        SESSION_SORT_KEY
    }

    fn vote(&self, _txn: &Txn) -> Result<()> {
        self.inner.flush()
    }

    fn finish(&self, _txn: &Txn) -> Result<()> {
        self.inner.close();
        Ok(())
    }

    fn abort(&self, _txn: &Txn) {
        self.inner.close();
    }
}
