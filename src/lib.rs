// src/lib.rs

//! Larder — a transactional, filesystem-backed hierarchical document store
//!
//! Persistent objects serialize as human-readable tagged documents, one per
//! object, in a directory tree mirroring the object tree: folders become
//! directories holding an `__index__.doc` plus one document per child, and
//! leaves become single documents. All writes stage against a copy-on-write
//! filesystem and land atomically when the transaction commits.
//!
//! # Architecture
//!
//! - Schemas describe models at runtime and register by tag; documents are
//!   self-describing YAML mappings carrying the tag
//! - A per-transaction session tracks identity and dirtiness of loaded
//!   objects and writes only what changed on commit
//! - The session and the staging filesystem both participate in a
//!   two-phase commit, ordered so the tree stages before the swap
//! - Opaque byte streams go to a content-addressed blob store, referenced
//!   from documents by digest
//!
//! # Example
//!
//! ```no_run
//! use larder::{FieldSpec, Model, Schema, StageFs, Store, TxnManager};
//!
//! # fn main() -> larder::Result<()> {
//! let note = Schema::model("note")
//!     .field(FieldSpec::text("body").default(""))
//!     .register();
//!
//! let txm = TxnManager::new();
//! let fs = StageFs::open("/var/lib/notes")?;
//! let store = Store::new(&txm, fs);
//!
//! let root = store.root()?;
//! let memo = Model::new(&note);
//! memo.set("body", "pick up dumplings")?;
//! root.insert("memo", memo)?;
//! txm.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod blob;
mod doc;
mod error;
pub mod filesystem;
pub mod model;
pub mod schema;
pub mod session;
pub mod store;
pub mod txn;
pub mod value;

pub use blob::{Blob, BlobStore};
pub use error::{Error, Result};
pub use filesystem::StageFs;
pub use model::Model;
pub use schema::{FieldDefault, FieldSpec, Kind, Schema, SchemaBuilder};
pub use session::Session;
pub use store::{Store, StoreConfig};
pub use txn::{ResourceManager, Txn, TxnManager};
pub use value::{TrackedList, TrackedMap, Value};
