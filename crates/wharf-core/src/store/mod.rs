//! Content-addressed file store
//!
//! Maps `sha256:<hex>` refs to files and friendly names to refs. Two
//! backends: an in-memory map for throwaway deployments and an embedded
//! key-value store (redb) that survives restarts. Scheduling correctness
//! depends on request-time file resolution, which lives here too.

mod memory;
mod redb_store;

pub use memory::MemoryFileStore;
pub use redb_store::RedbFileStore;

use crate::error::{StoreError, StoreResult};
use crate::file::{check_media_type, StoredFile};
use bytes::Bytes;
use std::path::Path;
use wharf_protocol::{File, Wasip1Params};

/// Backend interface of the file store.
///
/// Insertion of the same bytes is idempotent; `get` resolves refs directly
/// and falls back to the name-alias table.
pub trait FileStore: Send + Sync {
    /// Insert a blob with its media type. The optional `name` is recorded as
    /// an alias that resolves to the content address.
    fn insert(&self, name: Option<&str>, media: &str, blob: Bytes) -> StoreResult<StoredFile>;

    /// Fetch a file by ref or by alias.
    fn get(&self, name_or_ref: &str) -> Option<StoredFile>;

    /// Iterate over all stored files, keyed by ref.
    fn all(&self) -> Box<dyn Iterator<Item = (String, StoredFile)> + Send>;
}

/// The file store used by the broker: a backend plus resolution of file
/// arguments in offloading requests.
pub struct FileStorage {
    backend: Box<dyn FileStore>,
}

impl FileStorage {
    /// Open a store from a path spec: `""` or `":memory:"` for the in-memory
    /// backend, anything else is a redb database path.
    pub fn open(path_spec: &str) -> StoreResult<Self> {
        if path_spec.is_empty() || path_spec == ":memory:" {
            Ok(Self::in_memory())
        } else {
            Self::persistent(path_spec)
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryFileStore::new()),
        }
    }

    pub fn persistent(path: impl AsRef<Path>) -> StoreResult<Self> {
        Ok(Self {
            backend: Box::new(RedbFileStore::new(path)?),
        })
    }

    /// Check whether a file argument is usable in an offloading request:
    /// it must carry exactly one of an inline blob or a known ref. On
    /// success the media type and the canonical ref are populated.
    pub fn resolve_file(&self, file: Option<&mut File>) -> StoreResult<()> {
        let Some(file) = file else {
            return Ok(()); // nothing to resolve
        };

        match (&file.blob, &file.r#ref) {
            (None, None) => Err(StoreError::FileUnset),
            (Some(_), Some(_)) => Err(StoreError::FileAmbiguous),

            // inline blob: validate the media type if one was given
            (Some(_), None) => {
                if let Some(media) = file.media.as_deref().filter(|m| !m.is_empty()) {
                    file.media = Some(check_media_type(media)?);
                }
                Ok(())
            }

            // ref: must resolve through the store, directly or via alias
            (None, Some(r)) => match self.get(r) {
                Some(stored) => {
                    file.media = Some(stored.media.clone());
                    file.r#ref = Some(stored.file_ref().to_string());
                    Ok(())
                }
                None => Err(StoreError::NotFound(r.clone())),
            },
        }
    }

    /// Resolve all file arguments of a task specification, accumulating
    /// errors so a client sees every broken reference at once.
    pub fn resolve_params(&self, params: &mut Wasip1Params) -> StoreResult<()> {
        let mut errs = Vec::new();
        if let Err(e) = self.resolve_file(params.binary.as_mut()) {
            errs.push(e);
        }
        if let Err(e) = self.resolve_file(params.rootfs.as_mut()) {
            errs.push(e);
        }
        StoreError::join(errs)
    }
}

impl std::ops::Deref for FileStorage {
    type Target = dyn FileStore;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}
