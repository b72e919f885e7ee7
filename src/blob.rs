// src/blob.rs

//! Content-addressed blob storage
//!
//! Opaque byte streams live outside the document tree in a flat directory of
//! files named by the SHA-256 digest of their content. Writes stream through
//! a temp file and land with an atomic rename, so concurrent writers are
//! safe: every write targets a filename derived from its content.
//!
//! Blobs are not transactional; they are written the moment a stream is
//! stored. That is acceptable because documents reference blobs by digest
//! and the documents *are* transactional, so an aborted transaction leaves
//! at worst an unreferenced blob file behind.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::schema::{FieldSpec, Schema};
use crate::value::Value;

/// Reserved schema tag of the blob model
pub const BLOB_TAG: &str = "blob";

const DIGEST_FIELD: &str = "digest";

/// Content-addressed side store
#[derive(Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if necessary) a blob directory
    pub fn open(dir: impl AsRef<Path>) -> Result<BlobStore> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(BlobStore { dir })
    }

    /// Store a stream, returning its digest
    ///
    /// Re-adding existing content is a no-op that returns the same digest.
    pub fn add(&self, stream: &mut dyn Read) -> Result<String> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            total += n as u64;
        }
        let digest = hex::encode(hasher.finalize());
        let target = self.dir.join(&digest);
        if target.exists() {
            debug!(%digest, "blob already stored");
            return Ok(digest);
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| Error::Io(e.error))?;
        debug!(%digest, bytes = total, "stored blob");
        Ok(digest)
    }

    /// Open a stored blob for reading
    pub fn reader(&self, digest: &str) -> Result<fs::File> {
        Ok(fs::File::open(self.blob_path(digest)?)?)
    }

    /// Size in bytes of a stored blob
    pub fn size(&self, digest: &str) -> Result<u64> {
        Ok(fs::metadata(self.blob_path(digest)?)?.len())
    }

    /// Whether a blob with this digest is stored
    pub fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let valid = digest.len() == 64
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(Error::Configuration(format!(
                "'{digest}' is not a blob digest"
            )));
        }
        Ok(self.dir.join(digest))
    }
}

fn blob_schema() -> Arc<Schema> {
    if let Some(schema) = Schema::lookup(BLOB_TAG) {
        return schema;
    }
    Schema::model(BLOB_TAG)
        .field(FieldSpec::text(DIGEST_FIELD))
        .register()
}

/// A persistent handle to one blob
///
/// The model persists only the digest; the bytes live in the store's blob
/// directory. The blob must be attached to a store with a configured blob
/// store before content can be written or read.
pub struct Blob {
    model: Model,
}

impl Blob {
    pub fn new() -> Blob {
        Blob {
            model: Model::new(&blob_schema()),
        }
    }

    /// View an existing model as a blob
    pub fn from_model(model: Model) -> Result<Blob> {
        if model.schema().tag() != BLOB_TAG {
            return Err(Error::Configuration(format!(
                "model '!{}' is not a blob",
                model.schema().tag()
            )));
        }
        Ok(Blob { model })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    /// Store a stream and point this blob at it
    pub fn set(&self, stream: &mut dyn Read) -> Result<String> {
        let store = self.blob_store()?;
        let digest = store.add(stream)?;
        self.model.set(DIGEST_FIELD, digest.as_str())?;
        Ok(digest)
    }

    /// The digest this blob points at
    pub fn digest(&self) -> Result<String> {
        match self.model.get(DIGEST_FIELD)? {
            Value::Str(digest) => Ok(digest),
            other => Err(Error::Configuration(format!(
                "blob digest field holds {}",
                other.type_name()
            ))),
        }
    }

    /// Open the blob's content for reading
    pub fn reader(&self) -> Result<fs::File> {
        let store = self.blob_store()?;
        store.reader(&self.digest()?)
    }

    /// Size in bytes of the blob's content
    pub fn len(&self) -> Result<u64> {
        let store = self.blob_store()?;
        store.size(&self.digest()?)
    }

    fn blob_store(&self) -> Result<BlobStore> {
        let top = self.model.top_model();
        let session = top.state().session.live().ok_or_else(|| {
            Error::Configuration("blob is not attached to a store".to_string())
        })?;
        let store = session
            .store
            .upgrade()
            .ok_or_else(|| Error::Configuration("store is gone".to_string()))?;
        store
            .blobs
            .clone()
            .ok_or_else(|| Error::Configuration("no blob store is configured".to_string()))
    }
}

impl Default for Blob {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Blob> for Value {
    fn from(blob: Blob) -> Value {
        Value::Model(blob.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let digest = store.add(&mut &b"Hello, World!"[..]).unwrap();
        assert_eq!(
            digest,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );

        let mut content = Vec::new();
        store.reader(&digest).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"Hello, World!");
        assert_eq!(store.size(&digest).unwrap(), 13);
    }

    #[test]
    fn test_deduplication() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let a = store.add(&mut &b"same bytes"[..]).unwrap();
        let b = store.add(&mut &b"same bytes"[..]).unwrap();
        assert_eq!(a, b);
        assert!(store.contains(&a));
    }

    #[test]
    fn test_flat_layout() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let digest = store.add(&mut &b"x"[..]).unwrap();
        assert!(dir.path().join(&digest).is_file());
    }

    #[test]
    fn test_bad_digest_rejected() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        assert!(store.reader("nope").is_err());
        assert!(store.reader("../../etc/passwd").is_err());
        assert!(!store.contains("ZZ"));
    }

    #[test]
    fn test_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let digest = "a".repeat(64);
        assert!(store.reader(&digest).is_err());
        assert!(!store.contains(&digest));
    }

    #[test]
    fn test_unattached_blob_needs_store() {
        let blob = Blob::new();
        assert!(matches!(
            blob.set(&mut &b"data"[..]),
            Err(Error::Configuration(_))
        ));
    }
}
