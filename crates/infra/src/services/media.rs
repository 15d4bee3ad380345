use thiserror::Error;
use tracing::{error, info, instrument};

use postrelay_core::{Clock, DomainError, MediaId, UserId};

use crate::blob::{BlobError, BlobStore, BlobUpload};
use crate::read_model::{MediaAsset, MediaStore, StoreError};

#[derive(Debug, Error)]
pub enum MediaServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// Upload side of the media service.
pub struct MediaService<M, B> {
    media: M,
    blobs: B,
    clock: std::sync::Arc<dyn Clock>,
}

impl<M, B> core::fmt::Debug for MediaService<M, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MediaService").finish_non_exhaustive()
    }
}

impl<M, B> MediaService<M, B>
where
    M: MediaStore,
    B: BlobStore,
{
    pub fn new(media: M, blobs: B, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self { media, blobs, clock }
    }

    /// Store the blob, then record the asset. If the record cannot be written
    /// the blob is deleted again.
    #[instrument(skip(self, upload), fields(user_id = %user, name = %upload.original_name), err)]
    pub fn upload(&self, user: UserId, upload: BlobUpload) -> Result<MediaAsset, MediaServiceError> {
        if upload.bytes.is_empty() {
            return Err(DomainError::validation("no file uploaded").into());
        }
        if upload.original_name.trim().is_empty() || upload.mime_type.trim().is_empty() {
            return Err(DomainError::validation("file name and mime type are required").into());
        }

        let original_name = upload.original_name.clone();
        let mime_type = upload.mime_type.clone();
        let stored = self.blobs.upload(upload)?;

        let asset = MediaAsset {
            media_id: MediaId::new(),
            public_id: stored.public_id,
            url: stored.url,
            original_name,
            mime_type,
            user_id: user,
            created_at: self.clock.now(),
        };

        if let Err(e) = self.media.insert(asset.clone()) {
            if let Err(cleanup) = self.blobs.delete(&asset.public_id) {
                error!(public_id = %asset.public_id, error = %cleanup, "orphaned blob after failed insert");
            }
            return Err(e.into());
        }

        info!(media_id = %asset.media_id, public_id = %asset.public_id, "media uploaded");
        Ok(asset)
    }

    pub fn list(&self, user: &UserId) -> Result<Vec<MediaAsset>, MediaServiceError> {
        Ok(self.media.list_by_user(user)?)
    }

    pub fn get(&self, id: &MediaId) -> Result<MediaAsset, MediaServiceError> {
        self.media
            .get(id)?
            .ok_or_else(|| MediaServiceError::Domain(DomainError::not_found("media", id.as_str())))
    }
}
