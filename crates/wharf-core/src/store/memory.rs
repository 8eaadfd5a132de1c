//! In-memory file store backend

use super::FileStore;
use crate::error::StoreResult;
use crate::file::{check_media_type, StoredFile};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    /// files keyed by content address
    files: HashMap<String, StoredFile>,
    /// friendly names resolving to content addresses
    aliases: HashMap<String, String>,
}

/// A file store held entirely in memory. Contents are lost on restart, which
/// is fine for benchmarking and development deployments.
#[derive(Default)]
pub struct MemoryFileStore {
    inner: RwLock<Inner>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemoryFileStore {
    fn insert(&self, name: Option<&str>, media: &str, blob: Bytes) -> StoreResult<StoredFile> {
        // check the media type first because that's cheapest
        let media = check_media_type(media)?;

        let file = StoredFile::new(media, blob);
        let mut inner = self.inner.write();
        inner
            .files
            .insert(file.file_ref().to_string(), file.clone());
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            inner
                .aliases
                .insert(name.to_string(), file.file_ref().to_string());
        }
        Ok(file)
    }

    fn get(&self, name_or_ref: &str) -> Option<StoredFile> {
        let inner = self.inner.read();
        if let Some(file) = inner.files.get(name_or_ref) {
            return Some(file.clone());
        }
        inner
            .aliases
            .get(name_or_ref)
            .and_then(|r| inner.files.get(r))
            .cloned()
    }

    fn all(&self) -> Box<dyn Iterator<Item = (String, StoredFile)> + Send> {
        let snapshot: Vec<_> = self
            .inner
            .read()
            .files
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(snapshot.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_overwrite_points_to_new_ref() {
        let store = MemoryFileStore::new();
        let a = store
            .insert(Some("app"), "application/wasm", Bytes::from_static(b"v1"))
            .unwrap();
        let b = store
            .insert(Some("app"), "application/wasm", Bytes::from_static(b"v2"))
            .unwrap();
        assert_ne!(a.file_ref(), b.file_ref());
        // alias now resolves to the newer upload, the old blob stays reachable by ref
        assert_eq!(store.get("app").unwrap().file_ref(), b.file_ref());
        assert!(store.get(a.file_ref()).is_some());
    }

    #[test]
    fn test_rejects_bad_media() {
        let store = MemoryFileStore::new();
        assert!(store
            .insert(None, "video/mp4", Bytes::from_static(b"x"))
            .is_err());
    }

    #[test]
    fn test_get_unknown_is_none() {
        let store = MemoryFileStore::new();
        assert!(store.get("nope").is_none());
    }
}
