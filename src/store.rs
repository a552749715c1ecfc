//! The pluggable, in-process blob store. The trait is the stable
//! contract consumed by [`crate::transfer`]; [`MemoryStore`] is the only
//! backend this crate ships.

use crate::error::{Result, TftpError};
use crate::ErrorCode;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::RwLock;

/// A named byte blob. Ownership belongs to the store; every value handed
/// out by [`BlobStore::get`] is a deep copy independent of stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub name: String,
    pub data: Vec<u8>,
}

/// Contract every blob store backend must honor: `get`/`put` always
/// operate on deep copies, and `terminate` permanently invalidates the
/// store. Implementations must serialize mutations; readers may run
/// concurrently with other readers.
pub trait BlobStore: Send + Sync {
    /// Fetch a deep copy of the named blob, or fail with
    /// [`ErrorCode::NotFound`].
    fn get(&self, name: &str) -> impl Future<Output = Result<Blob>> + Send;

    /// Store a deep copy of `blob`, overwriting any prior entry of the
    /// same name. Never rejects on name collision.
    fn put(&self, blob: Blob) -> impl Future<Output = Result<()>> + Send;

    /// Invalidate the store. Every `get`/`put` after this fails.
    fn terminate(&self) -> impl Future<Output = ()> + Send;
}

/// The default, and only, backend: an in-memory map guarded by a
/// read-write lock. `get`/`put` always operate on deep copies and
/// `terminate` permanently invalidates the map.
pub struct MemoryStore {
    inner: RwLock<Option<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Some(HashMap::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Blob> {
        let guard = self.inner.read().await;
        let map = guard
            .as_ref()
            .ok_or_else(|| TftpError::protocol(ErrorCode::Disk, "store has been terminated"))?;
        match map.get(name) {
            Some(data) => Ok(Blob {
                name: name.to_string(),
                data: data.clone(),
            }),
            None => Err(TftpError::protocol(
                ErrorCode::NotFound,
                format!("the file '{name}' could not be found"),
            )),
        }
    }

    async fn put(&self, blob: Blob) -> Result<()> {
        let mut guard = self.inner.write().await;
        let map = guard
            .as_mut()
            .ok_or_else(|| TftpError::protocol(ErrorCode::Disk, "store has been terminated"))?;
        map.insert(blob.name, blob.data);
        Ok(())
    }

    async fn terminate(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }
}
