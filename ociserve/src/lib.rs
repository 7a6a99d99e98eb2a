pub mod blobs;
pub mod error;
pub mod manifests;
pub mod router;
pub mod uploads;

use std::sync::Arc;

use blobs::{BlobHandler, FsBlobHandler, MemBlobHandler};
use manifests::ManifestStore;
use uploads::UploadSet;

/// One registry instance: a blob handler, the upload sessions feeding it,
/// and the manifest index. Everything behind `Arc` so the axum router can
/// clone it per request.
pub struct Registry {
    pub(crate) blobs: Box<dyn BlobHandler>,
    pub(crate) uploads: UploadSet,
    pub(crate) manifests: ManifestStore,
}

impl Registry {
    pub fn new(blobs: Box<dyn BlobHandler>) -> Arc<Registry> {
        Arc::new(Registry {
            blobs,
            uploads: UploadSet::new(),
            manifests: ManifestStore::new(),
        })
    }

    pub fn in_memory() -> Arc<Registry> {
        Self::new(Box::new(MemBlobHandler::new()))
    }

    pub fn on_disk(dir: impl Into<std::path::PathBuf>) -> Arc<Registry> {
        Self::new(Box::new(FsBlobHandler::new(dir)))
    }

    pub fn router(self: &Arc<Registry>) -> axum::Router {
        router::router(self.clone())
    }
}
