//! Core domain types for the Wharf compute-offloading broker.
//!
//! This crate holds everything below the network layer: the content-addressed
//! file store with its two backends, the resizable counting semaphore used to
//! limit per-provider concurrency, the rolling throughput counter, metric
//! names and broker configuration.

pub mod config;
pub mod error;
pub mod file;
pub mod metrics;
pub mod rate;
pub mod semaphore;
pub mod store;

pub use config::{Config, SchedulerKind};
pub use error::{StoreError, StoreResult};
pub use file::{check_media_type, is_ref, sha256_ref, StoredFile};
pub use rate::RateCounter;
pub use semaphore::{AcquireCancelled, ResizableSemaphore};
pub use store::{FileStorage, FileStore, MemoryFileStore, RedbFileStore};
