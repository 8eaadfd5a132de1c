//! The simplest selector: any provider, no requirements checked

use super::{dynamic_submit, ScheduleError, Scheduler, SUBMIT_TIMEOUT};
use crate::error::Error;
use crate::provider::{AsyncTask, ProviderRegistry};
use async_trait::async_trait;
use std::sync::Arc;

/// Offers every task to all connected providers and lets the rendezvous pick
/// whichever has capacity first. Ignores file requirements entirely, so it
/// only makes sense when providers are uniform or tasks carry inline blobs.
pub struct AnyFreeSelector {
    registry: Arc<ProviderRegistry>,
}

impl AnyFreeSelector {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Scheduler for AnyFreeSelector {
    async fn schedule(&self, mut task: AsyncTask) -> Result<(), ScheduleError> {
        loop {
            let candidates = self.registry.values();
            if candidates.is_empty() {
                return Err(ScheduleError {
                    task,
                    source: Error::NoCandidates,
                });
            }

            let deadline = tokio::time::Instant::now() + SUBMIT_TIMEOUT;
            let token = task.token.clone();
            match dynamic_submit(&token, task, &candidates, Some(deadline)).await {
                Ok(()) => return Ok(()),
                // deadline hit: refresh the provider snapshot and offer again
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use wharf_core::FileStorage;
    use wharf_protocol::TaskRequest;

    #[tokio::test]
    async fn test_empty_registry_is_no_candidates() {
        let registry = ProviderRegistry::new(FileStorage::in_memory());
        let selector = AnyFreeSelector::new(registry);

        let (tx, _rx) = mpsc::channel(1);
        let task = AsyncTask::new(CancellationToken::new(), TaskRequest::default(), tx);
        let err = selector.schedule(task).await.unwrap_err();
        assert!(matches!(err.source, Error::NoCandidates));
    }
}
