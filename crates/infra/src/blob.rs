//! External blob storage seam used by the media service.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobError {
    #[error("blob {0} not found")]
    NotFound(String),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),

    #[error("blob store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUpload {
    pub original_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub public_id: String,
    pub url: String,
}

pub trait BlobStore: Send + Sync {
    fn upload(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError>;

    /// Deleting an unknown id reports `BlobError::NotFound`.
    fn delete(&self, public_id: &str) -> Result<(), BlobError>;
}

impl<B> BlobStore for Arc<B>
where
    B: BlobStore + ?Sized,
{
    fn upload(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError> {
        (**self).upload(upload)
    }

    fn delete(&self, public_id: &str) -> Result<(), BlobError> {
        (**self).delete(public_id)
    }
}

/// In-memory blob store with a switch to make deletes fail.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, BlobUpload>>,
    fail_deletes: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, public_id: &str) -> bool {
        self.blobs
            .read()
            .map(|m| m.contains_key(public_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn upload(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError> {
        let public_id = Uuid::now_v7().simple().to_string();
        let url = format!("memory://blobs/{public_id}");
        let mut map = self.blobs.write().map_err(|_| BlobError::Poisoned)?;
        map.insert(public_id.clone(), upload);
        Ok(StoredBlob { public_id, url })
    }

    fn delete(&self, public_id: &str) -> Result<(), BlobError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("injected delete failure".into()));
        }
        let mut map = self.blobs.write().map_err(|_| BlobError::Poisoned)?;
        map.remove(public_id)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(public_id.to_string()))
    }
}

/// Blob store on a local or mounted directory, one file per blob.
///
/// Upload writes a temporary file and renames it into place, so a crash never
/// leaves a half-written blob under its public id.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

fn unavailable(path: &Path, e: io::Error) -> BlobError {
    BlobError::Unavailable(format!("{}: {e}", path.display()))
}

impl FsBlobStore {
    /// Use `root`, creating it if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| unavailable(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Public ids are minted here; anything else cannot name a blob.
    fn path_of(&self, public_id: &str) -> Option<PathBuf> {
        let valid = !public_id.is_empty() && public_id.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then(|| self.root.join(public_id))
    }
}

impl BlobStore for FsBlobStore {
    fn upload(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError> {
        let public_id = Uuid::now_v7().simple().to_string();
        let path = self.root.join(&public_id);
        let staging = self.root.join(format!("{public_id}.partial"));

        let written = fs::File::create(&staging)
            .and_then(|mut f| f.write_all(&upload.bytes).and_then(|()| f.sync_all()))
            .and_then(|()| fs::rename(&staging, &path));
        if let Err(e) = written {
            let _ = fs::remove_file(&staging);
            return Err(unavailable(&path, e));
        }

        Ok(StoredBlob {
            url: format!("file://{}", path.display()),
            public_id,
        })
    }

    fn delete(&self, public_id: &str) -> Result<(), BlobError> {
        let path = self
            .path_of(public_id)
            .ok_or_else(|| BlobError::NotFound(public_id.to_string()))?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(public_id.to_string()))
            }
            Err(e) => Err(unavailable(&path, e)),
        }
    }
}
