use tracing::{debug, error, info};

use postrelay_events::{EventHandler, HandleOutcome, PostDeleted, PostEvent};

use crate::blob::{BlobError, BlobStore};
use crate::read_model::MediaStore;

use super::HandlerError;

/// Deletes the media attached to a deleted post.
///
/// The blob goes first, then the asset row. A blob that is already gone
/// counts as deleted, so redelivery after a partial run completes the job.
/// If the row delete fails after the blob is gone, the row is left dangling
/// and logged.
#[derive(Debug)]
pub struct MediaCleanupProjection<M, B> {
    media: M,
    blobs: B,
}

impl<M, B> MediaCleanupProjection<M, B>
where
    M: MediaStore,
    B: BlobStore,
{
    pub fn new(media: M, blobs: B) -> Self {
        Self { media, blobs }
    }

    fn on_deleted(&self, e: PostDeleted) -> Result<HandleOutcome, HandlerError> {
        let Some(media_id) = e.media_id else {
            return Ok(HandleOutcome::Skipped);
        };

        let Some(asset) = self.media.get(&media_id)? else {
            debug!(post_id = %e.post_id, media_id = %media_id, "media already removed");
            return Ok(HandleOutcome::Skipped);
        };

        match self.blobs.delete(&asset.public_id) {
            Ok(()) => {}
            Err(BlobError::NotFound(_)) => {
                debug!(public_id = %asset.public_id, "blob already absent");
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(err) = self.media.delete(&media_id) {
            error!(
                post_id = %e.post_id,
                media_id = %media_id,
                public_id = %asset.public_id,
                error = %err,
                "blob deleted but media row remains"
            );
            return Err(err.into());
        }

        info!(post_id = %e.post_id, media_id = %media_id, "media removed with post");
        Ok(HandleOutcome::Applied)
    }
}

impl<M, B> EventHandler for MediaCleanupProjection<M, B>
where
    M: MediaStore + 'static,
    B: BlobStore + 'static,
{
    type Event = PostEvent;
    type Error = HandlerError;

    fn name(&self) -> &'static str {
        "media.cleanup"
    }

    fn handle(&self, event: PostEvent) -> Result<HandleOutcome, HandlerError> {
        match event {
            PostEvent::Created(_) => Ok(HandleOutcome::Skipped),
            PostEvent::Deleted(e) => self.on_deleted(e),
        }
    }
}
