// src/model/folder.rs

//! Folder contents and child lifecycle
//!
//! Each folder materializes its contents cache from one directory listing on
//! first access; from then on the cache is authoritative for the rest of the
//! transaction, so insertions and deletions are visible without consulting
//! the filesystem again. Entries record whether the child is loaded, where
//! its bytes live, pending deletion, relocation (`detached_from`), and which
//! previous sibling the entry replaces.

use indexmap::IndexMap;
use tracing::debug;

use super::{Model, SessionRef};
use crate::doc::{self, DOC_SUFFIX, INDEX_DOC, INDEX_STEM};
use crate::error::{Error, Result};
use crate::filesystem::path;
use crate::value::Value;

/// Per-child record in a folder's contents cache
pub(crate) struct FolderEntry {
    pub(crate) name: String,
    pub(crate) is_folder: bool,
    pub(crate) loaded: Option<Model>,
    /// Store path of the child; set once the entry is parented
    pub(crate) path: Option<String>,
    /// Document file of the child; set once the entry is parented
    pub(crate) file: Option<String>,
    pub(crate) deleted: bool,
    /// Where the child's bytes live on disk if it was relocated
    pub(crate) detached_from: Option<String>,
    /// Previous sibling displaced by this entry; its on-disk footprint is
    /// removed before this entry's content is written
    pub(crate) replaces: Option<Box<FolderEntry>>,
}

impl FolderEntry {
    fn new(name: String, is_folder: bool, loaded: Option<Model>) -> Self {
        FolderEntry {
            name,
            is_folder,
            loaded,
            path: None,
            file: None,
            deleted: false,
            detached_from: None,
            replaces: None,
        }
    }

    fn set_parent(&mut self, parent_path: &str) {
        let child_path = path::join(parent_path, &self.name);
        self.file = Some(doc::doc_file(&child_path, self.is_folder));
        self.path = Some(child_path);
    }
}

impl Model {
    fn require_folder(&self) -> Result<()> {
        if self.is_folder() {
            Ok(())
        } else {
            Err(Error::NotAFolder(self.cell.schema.tag().to_string()))
        }
    }

    /// Materialize the contents cache from one directory listing
    ///
    /// A detached folder lists from its `detached_from` location; entries of
    /// a detached folder inherit relocated origins so their bytes can be
    /// moved rather than rewritten.
    pub(crate) fn ensure_contents(&self) -> Result<()> {
        if self.state().contents.is_some() {
            return Ok(());
        }
        let (session, detached, my_path) = {
            let st = self.state();
            (
                st.session.clone(),
                st.detached_from.clone(),
                st.path.clone(),
            )
        };
        let mut contents = IndexMap::new();
        if let Some(session) = session.live() {
            session.check_open()?;
            if let Some(my_path) = my_path {
                let base = detached.clone().unwrap_or_else(|| my_path.clone());
                let fs = session.fs.clone();
                if fs.isdir(&base) {
                    for fname in fs.listdir(&base)? {
                        if let Some(stem) = fname.strip_suffix(DOC_SUFFIX) {
                            if stem == INDEX_STEM {
                                continue;
                            }
                            let mut entry = FolderEntry::new(stem.to_string(), false, None);
                            entry.set_parent(&my_path);
                            if detached.is_some() {
                                entry.detached_from = Some(path::join(&base, stem));
                            }
                            contents.insert(stem.to_string(), entry);
                        } else {
                            let full = path::join(&base, &fname);
                            if fs.isdir(&full) && fs.exists(&path::join(&full, INDEX_DOC)) {
                                let mut entry = FolderEntry::new(fname.clone(), true, None);
                                entry.set_parent(&my_path);
                                if detached.is_some() {
                                    entry.detached_from = Some(full);
                                }
                                contents.insert(fname, entry);
                            }
                        }
                    }
                }
            }
        }
        self.state_mut().contents = Some(contents);
        Ok(())
    }

    fn with_contents<R>(&self, f: impl FnOnce(&mut IndexMap<String, FolderEntry>) -> R) -> R {
        let mut st = self.state_mut();
        f(st.contents.get_or_insert_with(IndexMap::new))
    }

    /// Whether a non-deleted entry exists for `name`
    pub fn contains(&self, name: &str) -> Result<bool> {
        self.require_folder()?;
        self.ensure_contents()?;
        Ok(self.with_contents(|c| c.get(name).map(|e| !e.deleted).unwrap_or(false)))
    }

    /// The child for `name`, or `None` if absent or deleted
    ///
    /// Materializes the child from its document on first access and caches
    /// it on the entry for the rest of the transaction.
    pub fn get_child(&self, name: &str) -> Result<Option<Model>> {
        self.require_folder()?;
        self.ensure_contents()?;
        let (entry_path, entry_file, is_folder, detached_from) = {
            let st = self.state();
            match st.contents.as_ref().and_then(|c| c.get(name)) {
                None => return Ok(None),
                Some(e) if e.deleted => return Ok(None),
                Some(e) => match &e.loaded {
                    Some(m) => return Ok(Some(m.clone())),
                    None => (
                        e.path.clone(),
                        e.file.clone(),
                        e.is_folder,
                        e.detached_from.clone(),
                    ),
                },
            }
        };
        let (Some(entry_path), Some(entry_file)) = (entry_path, entry_file) else {
            return Err(Error::Configuration(format!(
                "child '{name}' has no on-disk location"
            )));
        };
        let session = self.state().session.live().ok_or_else(|| {
            Error::Configuration("folder is not attached to a live session".to_string())
        })?;
        let source = match &detached_from {
            Some(origin) => doc::doc_file(origin, is_folder),
            None => entry_file.clone(),
        };
        let obj = session.load(&entry_path, &source, Some(self), Some(name))?;
        {
            let mut st = obj.state_mut();
            st.detached_from = detached_from;
            st.file = Some(entry_file);
        }
        self.with_contents(|c| {
            if let Some(e) = c.get_mut(name) {
                e.loaded = Some(obj.clone());
            }
        });
        debug!(path = %entry_path, "materialized child");
        Ok(Some(obj))
    }

    /// The child for `name`
    pub fn child(&self, name: &str) -> Result<Model> {
        self.get_child(name)?
            .ok_or_else(|| Error::KeyMissing(name.to_string()))
    }

    /// Add or replace the child at `name`
    ///
    /// The value must be a persistent model that is not live anywhere else.
    /// Replacing an existing name displaces the old entry: it is deleted,
    /// and the new entry remembers it (collapsing chains of same-name
    /// replacements to the original on-disk entry) so its footprint is
    /// removed at save time. When this folder is attached, the inserted
    /// model and all its descendants attach recursively.
    pub fn insert(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_folder()?;
        let Value::Model(obj) = value.into() else {
            return Err(Error::NotAModel);
        };
        path::check_name(name)?;
        {
            let st = obj.state();
            if let SessionRef::Live(_) = st.session {
                return Err(Error::AlreadyAttached {
                    path: st.path.clone().unwrap_or_default(),
                });
            }
        }
        self.ensure_contents()?;

        let mut entry = FolderEntry::new(name.to_string(), obj.is_folder(), Some(obj.clone()));
        entry.detached_from = obj.state().detached_from.clone();

        self.with_contents(|contents| {
            if let Some(old) = contents.insert(name.to_string(), entry) {
                let mut prior = match old.replaces {
                    Some(original) => *original,
                    None => old,
                };
                prior.deleted = true;
                if let Some(current) = contents.get_mut(name) {
                    current.replaces = Some(Box::new(prior));
                }
            }
        });

        {
            let mut st = obj.state_mut();
            st.parent = Some(self.downgrade());
            st.name = Some(name.to_string());
        }

        let folder_unattached = self.state().session.is_unattached();
        if !folder_unattached {
            attach(self, name)?;
        }
        obj.mark_dirty();
        Ok(())
    }

    /// Delete the child at `name`
    ///
    /// The entry is marked deleted (its on-disk footprint goes away at save
    /// time) and a loaded subtree is detached, remembering its origin so it
    /// can be grafted elsewhere within the same transaction.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.require_folder()?;
        self.ensure_contents()?;
        let loaded = {
            let mut st = self.state_mut();
            let contents = st.contents.get_or_insert_with(IndexMap::new);
            match contents.get_mut(name) {
                None => return Err(Error::KeyMissing(name.to_string())),
                Some(e) if e.deleted => return Err(Error::KeyMissing(name.to_string())),
                Some(e) => {
                    e.deleted = true;
                    e.loaded.is_some()
                }
            }
        };
        mark_dirty_children(self);
        if loaded {
            detach_entry(self, name)?;
        }
        Ok(())
    }

    /// Get then delete the child at `name`
    pub fn pop(&self, name: &str) -> Result<Model> {
        let obj = self.child(name)?;
        self.remove(name)?;
        Ok(obj)
    }

    /// Child names, in insertion order or ordered by the schema's declared
    /// sort key
    pub fn keys(&self) -> Result<Vec<String>> {
        self.require_folder()?;
        self.ensure_contents()?;
        let mut keys: Vec<String> = self.with_contents(|c| {
            c.iter()
                .filter(|(_, e)| !e.deleted)
                .map(|(k, _)| k.clone())
                .collect()
        });
        if let Some(cmp) = self.cell.schema.sort_key() {
            keys.sort_by(|a, b| cmp(a, b));
        }
        Ok(keys)
    }

    /// Children, in key order
    pub fn values(&self) -> Result<Vec<Model>> {
        self.keys()?.iter().map(|k| self.child(k)).collect()
    }

    /// `(name, child)` pairs, in key order
    pub fn items(&self) -> Result<Vec<(String, Model)>> {
        self.keys()?
            .into_iter()
            .map(|k| {
                let child = self.child(&k)?;
                Ok((k, child))
            })
            .collect()
    }

    /// Number of non-deleted children
    pub fn len(&self) -> Result<usize> {
        self.require_folder()?;
        self.ensure_contents()?;
        Ok(self.with_contents(|c| c.values().filter(|e| !e.deleted).count()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Flag `dirty_children` from `folder` up to the root
pub(crate) fn mark_dirty_children(folder: &Model) {
    let mut cursor = Some(folder.clone());
    while let Some(m) = cursor {
        m.state_mut().dirty_children = true;
        cursor = m.parent();
    }
}

/// Attach the entry `name` of `parent`, recursively
///
/// Computes the entry's path and file under the parent, moves a loaded child
/// into the parent's session, marks it dirty, and descends into folder
/// children. Entries keep their `detached_from` so relocated bytes move
/// instead of being rewritten.
pub(crate) fn attach(parent: &Model, name: &str) -> Result<()> {
    let Some(parent_path) = parent.state().path.clone() else {
        return Err(Error::Configuration(
            "cannot attach under a folder without a path".to_string(),
        ));
    };
    let session = parent.state().session.clone();

    let (loaded, is_folder, child_path, child_file) = {
        let mut st = parent.state_mut();
        let Some(entry) = st.contents.as_mut().and_then(|c| c.get_mut(name)) else {
            return Ok(());
        };
        let child_path = path::join(&parent_path, &entry.name);
        let child_file = doc::doc_file(&child_path, entry.is_folder);
        entry.path = Some(child_path.clone());
        entry.file = Some(child_file.clone());
        (entry.loaded.clone(), entry.is_folder, child_path, child_file)
    };

    let Some(obj) = loaded else {
        return Ok(());
    };
    let was_unattached = obj.state().session.is_unattached();
    {
        let mut st = obj.state_mut();
        st.session = session;
        st.path = Some(child_path);
        st.file = Some(child_file);
        st.dirty = true;
        if is_folder {
            st.dirty_children = true;
            if was_unattached {
                // A fresh subtree owns nothing on disk; whatever sits at its
                // new path belongs to the entry it replaces
                st.contents.get_or_insert_with(IndexMap::new);
            }
        }
    }
    if is_folder {
        obj.ensure_contents()?;
        let names: Vec<String> = obj
            .state()
            .contents
            .as_ref()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        for child_name in &names {
            attach(&obj, child_name)?;
        }
    }
    Ok(())
}

/// Detach the loaded child at entry `name` of `folder`, recursively
///
/// Records `detached_from` on the object and every cached descendant entry
/// before flipping the subtree out of the session, so a later re-attach can
/// move the on-disk bytes.
pub(crate) fn detach_entry(folder: &Model, name: &str) -> Result<()> {
    let (obj, is_folder) = {
        let st = folder.state();
        match st.contents.as_ref().and_then(|c| c.get(name)) {
            Some(entry) => match &entry.loaded {
                Some(m) => (m.clone(), entry.is_folder),
                None => return Ok(()),
            },
            None => return Ok(()),
        }
    };
    {
        let current = obj.state().path.clone();
        obj.state_mut().detached_from = current;
    }
    if is_folder {
        // Materialize while the session is still live
        obj.ensure_contents()?;
        let names: Vec<String> = obj
            .state()
            .contents
            .as_ref()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        for child_name in &names {
            let has_loaded = {
                let mut st = obj.state_mut();
                match st.contents.as_mut().and_then(|c| c.get_mut(child_name)) {
                    Some(entry) => {
                        entry.detached_from = entry.path.clone();
                        entry.loaded.is_some()
                    }
                    None => false,
                }
            };
            if has_loaded {
                detach_entry(&obj, child_name)?;
            }
        }
    }
    obj.state_mut().session = SessionRef::Detached;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, Schema};
    use std::sync::Arc;

    fn bin_schema() -> Arc<crate::schema::Schema> {
        Schema::folder("folder-test-bin")
            .field(FieldSpec::text("label").default(""))
            .register()
    }

    fn part_schema() -> Arc<crate::schema::Schema> {
        Schema::model("folder-test-part")
            .field(FieldSpec::int("size").default(1))
            .register()
    }

    #[test]
    fn test_insert_and_lookup_unattached() {
        let bin = Model::new(&bin_schema());
        let part = Model::new(&part_schema());
        bin.insert("a", part.clone()).unwrap();

        assert!(bin.contains("a").unwrap());
        assert!(!bin.contains("b").unwrap());
        assert!(bin.child("a").unwrap().ptr_eq(&part));
        assert!(matches!(bin.child("b"), Err(Error::KeyMissing(_))));
        assert_eq!(part.name().as_deref(), Some("a"));
        assert!(part.parent().unwrap().ptr_eq(&bin));
    }

    #[test]
    fn test_insert_non_model_rejected() {
        let bin = Model::new(&bin_schema());
        assert!(matches!(bin.insert("a", 5i64), Err(Error::NotAModel)));
    }

    #[test]
    fn test_insert_invalid_name_rejected() {
        let bin = Model::new(&bin_schema());
        for name in ["", "a/b", "..", "__index__", "x.doc"] {
            assert!(matches!(
                bin.insert(name, Model::new(&part_schema())),
                Err(Error::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_folder_ops_on_leaf_rejected() {
        let part = Model::new(&part_schema());
        assert!(matches!(part.contains("x"), Err(Error::NotAFolder(_))));
        assert!(matches!(
            part.insert("x", Model::new(&part_schema())),
            Err(Error::NotAFolder(_))
        ));
    }

    #[test]
    fn test_remove_marks_deleted() {
        let bin = Model::new(&bin_schema());
        bin.insert("a", Model::new(&part_schema())).unwrap();
        bin.remove("a").unwrap();
        assert!(!bin.contains("a").unwrap());
        assert!(matches!(bin.remove("a"), Err(Error::KeyMissing(_))));
        assert!(bin.state().dirty_children);
    }

    #[test]
    fn test_pop_returns_detached_child() {
        let bin = Model::new(&bin_schema());
        let part = Model::new(&part_schema());
        bin.insert("a", part.clone()).unwrap();
        let popped = bin.pop("a").unwrap();
        assert!(popped.ptr_eq(&part));
        assert!(!bin.contains("a").unwrap());
    }

    #[test]
    fn test_replace_collapses_chain() {
        let bin = Model::new(&bin_schema());
        bin.insert("a", Model::new(&part_schema())).unwrap();
        bin.insert("a", Model::new(&part_schema())).unwrap();
        bin.insert("a", Model::new(&part_schema())).unwrap();

        let st = bin.state();
        let entry = st.contents.as_ref().unwrap().get("a").unwrap();
        let replaced = entry.replaces.as_ref().unwrap();
        // The chain collapses to the original entry
        assert!(replaced.replaces.is_none());
        assert!(replaced.deleted);
    }

    #[test]
    fn test_keys_insertion_order_and_sorted() {
        let bin = Model::new(&bin_schema());
        for name in ["10", "8", "9"] {
            bin.insert(name, Model::new(&part_schema())).unwrap();
        }
        assert_eq!(bin.keys().unwrap(), vec!["10", "8", "9"]);

        let sorted = Schema::folder("folder-test-sorted")
            .sort_by(|a, b| match (a.parse::<i64>(), b.parse::<i64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => a.cmp(b),
            })
            .register();
        let bin = Model::new(&sorted);
        for name in ["10", "8", "9"] {
            bin.insert(name, Model::new(&part_schema())).unwrap();
        }
        assert_eq!(bin.keys().unwrap(), vec!["8", "9", "10"]);
        assert_eq!(bin.len().unwrap(), 3);
    }

    #[test]
    fn test_insert_marks_dirty() {
        let bin = Model::new(&bin_schema());
        let part = Model::new(&part_schema());
        bin.insert("a", part.clone()).unwrap();
        assert!(part.is_dirty());
        assert!(bin.state().dirty_children);
    }
}
