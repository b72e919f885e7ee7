// src/filesystem/mod.rs

//! Staging filesystem for the store
//!
//! All writes between commits land in a staging copy of the committed tree.
//! Commit swaps the staging copy in atomically; abort discards it. Paths are
//! virtual, rooted at the store root (`/`), and mapped onto the physical
//! layout by [`StageFs`].

pub(crate) mod path;
mod stage;

pub use stage::StageFs;
