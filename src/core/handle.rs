//! Async facade over [`BlockManager`]
//!
//! Every operation does blocking file I/O, so each call is moved onto tokio's
//! blocking pool. The manager itself is shared through an `Arc`.

use crate::error::{BlockError, Result};
use crate::locator::{BlockId, ImageMetadata, Locator, Relocation};
use crate::manager::{BlockManager, DeleteOutcome, ManagerStats};
use std::sync::Arc;

#[derive(Clone)]
pub struct AsyncBlockManager {
    inner: Arc<BlockManager>,
}

impl AsyncBlockManager {
    pub fn new(manager: BlockManager) -> Self {
        AsyncBlockManager {
            inner: Arc::new(manager),
        }
    }

    pub fn from_shared(manager: Arc<BlockManager>) -> Self {
        AsyncBlockManager { inner: manager }
    }

    /// Underlying synchronous manager
    pub fn blocking(&self) -> &Arc<BlockManager> {
        &self.inner
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BlockManager) -> Result<T> + Send + 'static,
    {
        let manager = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| BlockError::AllocationFailure(format!("blocking task failed: {}", e)))?
    }

    pub async fn save_image(&self, raw: Vec<u8>) -> Result<ImageMetadata> {
        self.run(move |manager| manager.save_image(&raw)).await
    }

    pub async fn read_image(&self, locator: Locator) -> Result<Arc<[u8]>> {
        self.run(move |manager| manager.read_image(&locator)).await
    }

    pub async fn delete_image(&self, locator: Locator) -> Result<DeleteOutcome> {
        self.run(move |manager| manager.delete_image(&locator)).await
    }

    pub async fn compact(&self, block_id: BlockId) -> Result<Vec<Relocation>> {
        self.run(move |manager| manager.compact(block_id)).await
    }

    pub async fn sync(&self) -> Result<()> {
        self.run(|manager| manager.sync()).await
    }

    /// Cache and block statistics; never touches disk
    pub fn stats(&self) -> ManagerStats {
        self.inner.stats()
    }
}
