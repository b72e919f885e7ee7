// src/store.rs

//! Store facade
//!
//! A [`Store`] owns the staging filesystem handle, an optional blob store,
//! and the factory that produces a root for a virgin store. Each transaction
//! gets its own session; the store creates one lazily, joins it (and the
//! filesystem) to the current transaction, and reuses it until the
//! transaction ends.

use std::cell::RefCell;
use std::rc::Rc;

use crate::blob::BlobStore;
use crate::error::Result;
use crate::filesystem::StageFs;
use crate::model::Model;
use crate::schema::builtin_folder;
use crate::session::{Session, SessionInner};
use crate::txn::TxnManager;

/// Store configuration
///
/// `factory` is a zero-argument constructor producing the root for an
/// uninitialized store; it defaults to an empty folder. `blob_store` enables
/// blob fields.
#[derive(Default)]
pub struct StoreConfig {
    pub factory: Option<Rc<dyn Fn() -> Model>>,
    pub blob_store: Option<BlobStore>,
}

pub(crate) struct StoreInner {
    txm: TxnManager,
    fs: StageFs,
    pub(crate) blobs: Option<BlobStore>,
    factory: Rc<dyn Fn() -> Model>,
    session: RefCell<Option<Rc<SessionInner>>>,
}

/// A document store
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Store {
    /// A store with the default configuration
    pub fn new(txm: &TxnManager, fs: StageFs) -> Store {
        Self::with_config(txm, fs, StoreConfig::default())
    }

    pub fn with_config(txm: &TxnManager, fs: StageFs, config: StoreConfig) -> Store {
        let factory = config
            .factory
            .unwrap_or_else(|| Rc::new(|| Model::new(&builtin_folder())));
        Store {
            inner: Rc::new(StoreInner {
                txm: txm.clone(),
                fs,
                blobs: config.blob_store,
                factory,
                session: RefCell::new(None),
            }),
        }
    }

    /// The root object for the current transaction
    ///
    /// Loads it on first access; for a virgin store the configured factory
    /// constructs a fresh root, installed dirty.
    pub fn root(&self) -> Result<Model> {
        let session = self.session_inner()?;
        session.get_root(self.inner.factory.as_ref())
    }

    /// Replace the current transaction's root
    pub fn set_root(&self, root: Model) -> Result<()> {
        self.session_inner()?.set_root(root)
    }

    /// Write unsaved changes to the staging filesystem without committing
    pub fn flush(&self) -> Result<()> {
        self.session_inner()?.flush()
    }

    /// The current session, created and joined to the current transaction if
    /// needed
    pub fn session(&self) -> Result<Session> {
        Ok(Session {
            inner: self.session_inner()?,
        })
    }

    /// The staging filesystem
    pub fn fs(&self) -> &StageFs {
        &self.inner.fs
    }

    fn session_inner(&self) -> Result<Rc<SessionInner>> {
        let mut slot = self.inner.session.borrow_mut();
        if let Some(existing) = slot.as_ref() {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let inner = Rc::new(SessionInner::new(
            Rc::downgrade(&self.inner),
            self.inner.fs.clone(),
        ));
        let txn = self.inner.txm.current();
        txn.join(Rc::new(Session {
            inner: inner.clone(),
        }));
        self.inner.fs.join(&txn);
        *slot = Some(inner.clone());
        Ok(inner)
    }
}
