//! Wharf broker runtime
//!
//! The broker sits between task-submitting clients and a dynamic pool of
//! browser-resident providers executing WASI and Pyodide tasks. This crate
//! implements the moving parts:
//!
//! - [`transport`] — framed duplex connections (WebSocket in production, an
//!   in-memory pair for tests) carrying protocol envelopes
//! - [`messenger`] — bidirectional RPC over a transport: sequence numbers,
//!   pending-call registry, event streams
//! - [`provider`] — per-connection provider session, task submission gate,
//!   file RPCs and the concurrent registry of live sessions
//! - [`scheduler`] — provider selection strategies and the dynamic
//!   rendezvous submit
//! - [`dispatcher`] — the queue consumer with bounded parallelism and retry
//! - [`jobs`] — job-to-task fan-out and completion aggregation
//! - [`http`] — the axum surface: storage, client API and socket upgrades

pub mod dispatcher;
pub mod error;
pub mod http;
pub mod jobs;
pub mod lifetime;
pub mod messenger;
pub mod provider;
pub mod scheduler;
pub mod transport;

pub use error::{Error, Result};
pub use lifetime::Lifetime;
