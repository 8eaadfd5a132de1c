//! The default selector: match on file availability, prefer free capacity

use super::{dynamic_submit, ScheduleError, Scheduler, SUBMIT_TIMEOUT};
use crate::error::Error;
use crate::provider::{AsyncTask, Provider, ProviderRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Selects providers whose known file set contains every ref the task
/// requires. Among those, providers with free capacity (or currently parked
/// on their gate) are preferred; when all are saturated, the offer goes to
/// the full candidate list so the task still lands somewhere once capacity
/// frees up.
pub struct SimpleMatchSelector {
    registry: Arc<ProviderRegistry>,
}

impl SimpleMatchSelector {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub(crate) fn select_candidates(&self, task: &AsyncTask) -> Result<Vec<Arc<Provider>>, Error> {
        let required = task.request.required_files();

        let matching: Vec<_> = self
            .registry
            .values()
            .into_iter()
            .filter(|p| required.iter().all(|file| p.has_file(file)))
            .collect();

        if matching.is_empty() {
            debug!(
                task = %task.request.task_id(),
                ?required,
                "no provider satisfies the file requirements"
            );
            return Err(Error::NoCandidates);
        }

        // the `waiting` check is a heuristic: a parked loop holds a permit
        // that the count already includes
        let free: Vec<_> = matching
            .iter()
            .filter(|p| p.current_tasks() < p.current_limit() || p.waiting())
            .cloned()
            .collect();

        Ok(if free.is_empty() { matching } else { free })
    }
}

#[async_trait]
impl Scheduler for SimpleMatchSelector {
    async fn schedule(&self, mut task: AsyncTask) -> Result<(), ScheduleError> {
        loop {
            let candidates = match self.select_candidates(&task) {
                Ok(candidates) => candidates,
                Err(source) => return Err(ScheduleError { task, source }),
            };

            let deadline = tokio::time::Instant::now() + SUBMIT_TIMEOUT;
            let token = task.token.clone();
            match dynamic_submit(&token, task, &candidates, Some(deadline)).await {
                Ok(()) => return Ok(()),
                // reschedule in hopes of picking up provider store changes
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
