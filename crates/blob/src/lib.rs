//! External blob storage for oversize transaction payloads.
//!
//! Blobs are addressed by transaction hash plus a file-type discriminator.
//! `put` is idempotent: writing a key that already holds content reports
//! `AlreadyExists`, which callers treat as success.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bsvd_consensus::Hash256;
use bsvd_primitives::hash256_to_hex;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FileType {
    /// Full extended transaction bytes.
    Tx,
    /// Output set only (partial transaction, inputs not yet known).
    Outputs,
    /// Block body, written by the block persister.
    Block,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Tx => "tx",
            FileType::Outputs => "outputs",
            FileType::Block => "block",
        }
    }
}

#[derive(Debug)]
pub enum BlobError {
    /// Content already present at this address. Treated as success by
    /// callers because the store is content-addressed.
    AlreadyExists,
    Io(std::io::Error),
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::AlreadyExists => write!(f, "blob already exists"),
            BlobError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io(err)
    }
}

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &Hash256, file_type: FileType, bytes: &[u8]) -> Result<(), BlobError>;
    fn get(&self, key: &Hash256, file_type: FileType) -> Result<Option<Vec<u8>>, BlobError>;
    fn exists(&self, key: &Hash256, file_type: FileType) -> Result<bool, BlobError>;
    fn delete(&self, key: &Hash256, file_type: FileType) -> Result<(), BlobError>;
}

impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    fn put(&self, key: &Hash256, file_type: FileType, bytes: &[u8]) -> Result<(), BlobError> {
        self.as_ref().put(key, file_type, bytes)
    }

    fn get(&self, key: &Hash256, file_type: FileType) -> Result<Option<Vec<u8>>, BlobError> {
        self.as_ref().get(key, file_type)
    }

    fn exists(&self, key: &Hash256, file_type: FileType) -> Result<bool, BlobError> {
        self.as_ref().exists(key, file_type)
    }

    fn delete(&self, key: &Hash256, file_type: FileType) -> Result<(), BlobError> {
        self.as_ref().delete(key, file_type)
    }
}

/// Disk-backed blob store with two-level fan-out directories.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &Hash256, file_type: FileType) -> PathBuf {
        self.root
            .join(format!("{:02x}", key[0]))
            .join(format!("{:02x}", key[1]))
            .join(format!("{}.{}", hash256_to_hex(key), file_type.as_str()))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &Hash256, file_type: FileType, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.blob_path(key, file_type);
        if path.exists() {
            return Err(BlobError::AlreadyExists);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Publish atomically so a reader never observes a torn blob.
        let tmp = path.with_extension(format!("{}.tmp", file_type.as_str()));
        fs::write(&tmp, bytes)?;
        if fs::rename(&tmp, &path).is_err() {
            let _ = fs::remove_file(&tmp);
            if path.exists() {
                return Err(BlobError::AlreadyExists);
            }
            fs::write(&path, bytes)?;
        }
        Ok(())
    }

    fn get(&self, key: &Hash256, file_type: FileType) -> Result<Option<Vec<u8>>, BlobError> {
        match fs::read(self.blob_path(key, file_type)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, key: &Hash256, file_type: FileType) -> Result<bool, BlobError> {
        Ok(self.blob_path(key, file_type).exists())
    }

    fn delete(&self, key: &Hash256, file_type: FileType) -> Result<(), BlobError> {
        match fs::remove_file(self.blob_path(key, file_type)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: RwLock<HashMap<(Hash256, FileType), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("blob store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &Hash256, file_type: FileType, bytes: &[u8]) -> Result<(), BlobError> {
        let mut guard = self.inner.write().expect("blob store lock");
        let entry = (*key, file_type);
        if guard.contains_key(&entry) {
            return Err(BlobError::AlreadyExists);
        }
        guard.insert(entry, bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &Hash256, file_type: FileType) -> Result<Option<Vec<u8>>, BlobError> {
        let guard = self.inner.read().expect("blob store lock");
        Ok(guard.get(&(*key, file_type)).cloned())
    }

    fn exists(&self, key: &Hash256, file_type: FileType) -> Result<bool, BlobError> {
        let guard = self.inner.read().expect("blob store lock");
        Ok(guard.contains_key(&(*key, file_type)))
    }

    fn delete(&self, key: &Hash256, file_type: FileType) -> Result<(), BlobError> {
        let mut guard = self.inner.write().expect("blob store lock");
        guard.remove(&(*key, file_type));
        Ok(())
    }
}
