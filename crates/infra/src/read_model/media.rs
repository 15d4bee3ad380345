use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use postrelay_core::{MediaId, UserId};

use super::StoreError;

/// Metadata of an uploaded blob, owned by the media service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub media_id: MediaId,
    /// Blob store handle.
    pub public_id: String,
    pub url: String,
    pub original_name: String,
    pub mime_type: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

pub trait MediaStore: Send + Sync {
    fn insert(&self, asset: MediaAsset) -> Result<(), StoreError>;

    fn get(&self, id: &MediaId) -> Result<Option<MediaAsset>, StoreError>;

    /// Returns whether a row was removed.
    fn delete(&self, id: &MediaId) -> Result<bool, StoreError>;

    fn list_by_user(&self, user: &UserId) -> Result<Vec<MediaAsset>, StoreError>;
}

impl<S> MediaStore for Arc<S>
where
    S: MediaStore + ?Sized,
{
    fn insert(&self, asset: MediaAsset) -> Result<(), StoreError> {
        (**self).insert(asset)
    }

    fn get(&self, id: &MediaId) -> Result<Option<MediaAsset>, StoreError> {
        (**self).get(id)
    }

    fn delete(&self, id: &MediaId) -> Result<bool, StoreError> {
        (**self).delete(id)
    }

    fn list_by_user(&self, user: &UserId) -> Result<Vec<MediaAsset>, StoreError> {
        (**self).list_by_user(user)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMediaStore {
    inner: RwLock<HashMap<MediaId, MediaAsset>>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaStore for InMemoryMediaStore {
    fn insert(&self, asset: MediaAsset) -> Result<(), StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        map.insert(asset.media_id.clone(), asset);
        Ok(())
    }

    fn get(&self, id: &MediaId) -> Result<Option<MediaAsset>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(id).cloned())
    }

    fn delete(&self, id: &MediaId) -> Result<bool, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        Ok(map.remove(id).is_some())
    }

    fn list_by_user(&self, user: &UserId) -> Result<Vec<MediaAsset>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let mut assets: Vec<MediaAsset> = map.values().filter(|a| &a.user_id == user).cloned().collect();
        assets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(assets)
    }
}
