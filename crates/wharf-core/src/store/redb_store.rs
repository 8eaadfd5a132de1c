//! redb-backed persistent file store
//!
//! Pure Rust embedded key-value store with ACID transactions; three tables
//! hold blobs, media types and name aliases, all keyed by strings.

use super::FileStore;
use crate::error::{StoreError, StoreResult};
use crate::file::{check_media_type, StoredFile};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use tracing::info;

const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const MEDIA: TableDefinition<&str, &str> = TableDefinition::new("mediatypes");
const ALIASES: TableDefinition<&str, &str> = TableDefinition::new("aliases");

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// File store persisted in a single redb database file.
pub struct RedbFileStore {
    db: Database,
}

impl RedbFileStore {
    /// Open or create the database at `path` and ensure all tables exist.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(backend_err)?;
        }

        let db = Database::create(path).map_err(backend_err)?;
        let txn = db.begin_write().map_err(backend_err)?;
        {
            txn.open_table(BLOBS).map_err(backend_err)?;
            txn.open_table(MEDIA).map_err(backend_err)?;
            txn.open_table(ALIASES).map_err(backend_err)?;
        }
        txn.commit().map_err(backend_err)?;

        info!(path = %path.display(), "opened file storage");
        Ok(Self { db })
    }

    fn get_by_ref(&self, r#ref: &str) -> Option<StoredFile> {
        let txn = self.db.begin_read().ok()?;
        let blobs = txn.open_table(BLOBS).ok()?;
        let media = txn.open_table(MEDIA).ok()?;

        let blob = blobs.get(r#ref).ok()??;
        let media = media.get(r#ref).ok()??;
        Some(StoredFile::new(
            media.value(),
            Bytes::from(blob.value().to_vec()),
        ))
    }
}

impl FileStore for RedbFileStore {
    fn insert(&self, name: Option<&str>, media: &str, blob: Bytes) -> StoreResult<StoredFile> {
        // check the media type first because that's cheapest
        let media = check_media_type(media)?;
        let file = StoredFile::new(media.clone(), blob);
        let r#ref = file.file_ref();

        let txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut blobs = txn.open_table(BLOBS).map_err(backend_err)?;
            blobs.insert(r#ref, &file.bytes[..]).map_err(backend_err)?;
            let mut medias = txn.open_table(MEDIA).map_err(backend_err)?;
            medias.insert(r#ref, media.as_str()).map_err(backend_err)?;
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                let mut aliases = txn.open_table(ALIASES).map_err(backend_err)?;
                aliases.insert(name, r#ref).map_err(backend_err)?;
            }
        }
        txn.commit().map_err(backend_err)?;
        Ok(file)
    }

    fn get(&self, name_or_ref: &str) -> Option<StoredFile> {
        if let Some(file) = self.get_by_ref(name_or_ref) {
            return Some(file);
        }
        // try the alias table
        let txn = self.db.begin_read().ok()?;
        let aliases = txn.open_table(ALIASES).ok()?;
        let r#ref = aliases.get(name_or_ref).ok()??.value().to_string();
        self.get_by_ref(&r#ref)
    }

    fn all(&self) -> Box<dyn Iterator<Item = (String, StoredFile)> + Send> {
        let mut files = Vec::new();
        if let Ok(txn) = self.db.begin_read() {
            if let (Ok(blobs), Ok(medias)) = (txn.open_table(BLOBS), txn.open_table(MEDIA)) {
                if let Ok(range) = blobs.iter() {
                    for entry in range.flatten() {
                        let (key, blob) = (entry.0, entry.1);
                        let r#ref = key.value().to_string();
                        let media = medias
                            .get(key.value())
                            .ok()
                            .flatten()
                            .map(|m| m.value().to_string())
                            .unwrap_or_default();
                        files.push((
                            r#ref,
                            StoredFile::new(media, Bytes::from(blob.value().to_vec())),
                        ));
                    }
                }
            }
        }
        Box::new(files.into_iter())
    }
}
