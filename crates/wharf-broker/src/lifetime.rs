//! Cancellable lifetimes with a close cause
//!
//! A [`Lifetime`] is a cancellation token plus the reason it was cancelled.
//! Long-lived actors (messengers, provider sessions) carry one to signal
//! closure upwards and to fail their in-flight work with the actual cause
//! instead of a bare "cancelled".

use crate::error::Error;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// A long-running context that can be cancelled once, with a cause.
/// Cheap to clone; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct Lifetime {
    token: CancellationToken,
    cause: Arc<OnceLock<Error>>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with a cause. Only the first cause sticks; repeated calls are
    /// no-ops.
    pub fn cancel(&self, cause: Error) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// The close cause, or `None` while still alive.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            Some(
                self.cause
                    .get()
                    .cloned()
                    .unwrap_or_else(|| Error::Closing("lifetime ended".to_string())),
            )
        } else {
            None
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for closure.
    pub async fn closing(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for use in `select!` arms and semaphore waits.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
