// src/filesystem/path.rs

//! Virtual store-path helpers
//!
//! Store paths are `/`-separated strings rooted at the store root. Child
//! names are validated before they enter the tree so no name can escape the
//! store directory or collide with the reserved index document.

use crate::doc::{DOC_SUFFIX, INDEX_STEM};
use crate::error::{Error, Result};

/// Join a parent path and a child name
pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Validate a child name before it enters a folder
///
/// Rejects empty names, path separators, dot components, the reserved index
/// name, and names carrying the document suffix (they would collide with
/// sibling documents on disk).
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
        || name == INDEX_STEM
        || name.ends_with(DOC_SUFFIX)
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Split a virtual path into its components, rejecting traversal
pub(crate) fn components(vpath: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    for part in vpath.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(Error::InvalidName(vpath.to_string())),
            _ => parts.push(part),
        }
    }
    Ok(parts)
}
