// src/txn.rs

//! Two-phase-commit transaction coordinator
//!
//! Resource managers join the current transaction and are driven through
//! `begin -> commit -> vote -> finish`, sorted by their stable sort keys so
//! participants run in a deterministic order. Any failure up to and
//! including the vote aborts every joined resource manager and surfaces the
//! original error.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// A participant in a two-phase commit
///
/// `vote` is the only phase that may write to the staging filesystem;
/// `finish` makes the transaction's effects durable and `abort` discards
/// them. `begin` and `commit` default to no-ops.
pub trait ResourceManager {
    /// Stable key ordering this participant among its peers
    fn sort_key(&self) -> &str;

    /// Called once before any other phase
    fn begin(&self, _txn: &Txn) -> Result<()> {
        Ok(())
    }

    /// Single-phase commit work, before voting starts
    fn commit(&self, _txn: &Txn) -> Result<()> {
        Ok(())
    }

    /// Prepare phase; the last chance to fail the transaction
    fn vote(&self, txn: &Txn) -> Result<()>;

    /// Finalize after every participant voted
    fn finish(&self, txn: &Txn) -> Result<()>;

    /// Discard all transaction state
    fn abort(&self, txn: &Txn);
}

struct TxnInner {
    id: Uuid,
    resources: RefCell<Vec<Rc<dyn ResourceManager>>>,
}

/// Handle to one transaction
#[derive(Clone)]
pub struct Txn {
    inner: Rc<TxnInner>,
}

impl Txn {
    /// The transaction's unique id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Join a resource manager to this transaction
    ///
    /// Joining is idempotent per sort key: a participant that already joined
    /// is not added again.
    pub fn join(&self, rm: Rc<dyn ResourceManager>) {
        let mut resources = self.inner.resources.borrow_mut();
        if resources.iter().any(|r| r.sort_key() == rm.sort_key()) {
            return;
        }
        debug!(txn = %self.inner.id, key = rm.sort_key(), "resource joined transaction");
        resources.push(rm);
    }
}

/// Transaction coordinator
///
/// Holds at most one current transaction. `current` begins one lazily;
/// `commit` and `abort` end it. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TxnManager {
    state: Rc<RefCell<Option<Rc<TxnInner>>>>,
}

impl TxnManager {
    /// Create a coordinator with no current transaction
    pub fn new() -> Self {
        TxnManager {
            state: Rc::new(RefCell::new(None)),
        }
    }

    /// The current transaction, beginning one if none is active
    pub fn current(&self) -> Txn {
        let mut state = self.state.borrow_mut();
        let inner = state.get_or_insert_with(|| {
            let id = Uuid::new_v4();
            debug!(txn = %id, "transaction started");
            Rc::new(TxnInner {
                id,
                resources: RefCell::new(Vec::new()),
            })
        });
        Txn {
            inner: inner.clone(),
        }
    }

    /// Commit the current transaction
    ///
    /// Runs `begin`, `commit`, and `vote` over every joined resource in sort
    /// order; a failure in any of them aborts all resources and returns the
    /// error. Once every vote succeeds, `finish` runs on each resource.
    pub fn commit(&self) -> Result<()> {
        let Some(inner) = self.state.borrow_mut().take() else {
            return Ok(());
        };
        let txn = Txn { inner };
        let mut resources = txn.inner.resources.borrow().clone();
        resources.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));

        debug!(txn = %txn.id(), resources = resources.len(), "committing transaction");
        let prepared = (|| -> Result<()> {
            for rm in &resources {
                rm.begin(&txn)?;
            }
            for rm in &resources {
                rm.commit(&txn)?;
            }
            for rm in &resources {
                rm.vote(&txn)?;
            }
            Ok(())
        })();

        if let Err(e) = prepared {
            warn!(txn = %txn.id(), error = %e, "transaction failed, aborting");
            for rm in &resources {
                rm.abort(&txn);
            }
            return Err(e);
        }

        let mut first_err = None;
        for rm in &resources {
            if let Err(e) = rm.finish(&txn) {
                warn!(txn = %txn.id(), key = rm.sort_key(), error = %e, "finish failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                debug!(txn = %txn.id(), "transaction committed");
                Ok(())
            }
        }
    }

    /// Abort the current transaction, discarding all staged state
    pub fn abort(&self) {
        let Some(inner) = self.state.borrow_mut().take() else {
            return;
        };
        let txn = Txn { inner };
        let resources = txn.inner.resources.borrow().clone();
        debug!(txn = %txn.id(), "aborting transaction");
        for rm in &resources {
            rm.abort(&txn);
        }
    }
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}
