//! Round-robin selector

use super::{dynamic_submit, ScheduleError, Scheduler, SUBMIT_TIMEOUT};
use crate::error::Error;
use crate::provider::{AsyncTask, Provider, ProviderRegistry};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Yields one provider after the next without concerning itself with any
/// conditions or capacity counts. Round-robin over a concurrent map needs a
/// sorted key snapshot for a stable order; keys that vanish between snapshot
/// and load are skipped.
pub struct RoundRobinSelector {
    registry: Arc<ProviderRegistry>,
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            index: AtomicUsize::new(0),
        }
    }

    fn next_candidate(&self) -> Result<Arc<Provider>, Error> {
        loop {
            let mut keys = self.registry.keys();
            if keys.is_empty() {
                return Err(Error::NoCandidates);
            }
            keys.sort();

            let index = self.index.fetch_add(1, Ordering::Relaxed) % keys.len();
            match self.registry.load(&keys[index]) {
                Some(provider) => return Ok(provider),
                // key deleted between snapshot and load, try the next one
                None => continue,
            }
        }
    }
}

#[async_trait]
impl Scheduler for RoundRobinSelector {
    async fn schedule(&self, mut task: AsyncTask) -> Result<(), ScheduleError> {
        loop {
            let candidate = match self.next_candidate() {
                Ok(candidate) => candidate,
                Err(source) => return Err(ScheduleError { task, source }),
            };

            let deadline = tokio::time::Instant::now() + SUBMIT_TIMEOUT;
            let token = task.token.clone();
            match dynamic_submit(&token, task, &[candidate], Some(deadline)).await {
                Ok(()) => return Ok(()),
                // this one is busy, move on to the next provider in order
                Err((returned, Error::SubmitTimeout)) => task = returned,
                Err((returned, source)) => {
                    return Err(ScheduleError {
                        task: returned,
                        source,
                    })
                }
            }
        }
    }
}
