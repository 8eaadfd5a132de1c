//! The task dispatcher
//!
//! A background actor consuming the global task queue. A ticket pool bounds
//! concurrent scheduling activities; each task runs through up to
//! [`RETRY_ROUNDS`] attempts. Transport-level failures are retried because
//! browser providers disconnect frequently — the retry re-runs the selector,
//! which naturally avoids torn-down sessions. Application errors are the
//! client's fault and are never retried.
//!
//! Retrying implies at-least-once execution: a task whose provider died
//! after finishing may run again elsewhere.

use crate::error::Error;
use crate::provider::{AsyncTask, ProviderRegistry, TaskCompletion};
use crate::scheduler::Scheduler;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// Concurrent scheduling activities.
const TICKETS: usize = 8;

/// Maximum attempts per task. A fuse, not a correctness mechanism.
const RETRY_ROUNDS: usize = 10;

/// Pause after a selector failure, so the rounds are not burned through
/// while the provider pool is in flux (a disconnect, an upload in flight).
const SELECTOR_RETRY_PAUSE: std::time::Duration = std::time::Duration::from_millis(100);

/// Consume the task queue until it closes. Spawn once per broker:
///
/// ```ignore
/// let (queue_tx, queue_rx) = tokio::sync::mpsc::channel(10);
/// tokio::spawn(dispatcher::run(queue_rx, selector, registry));
/// ```
pub async fn run(
    mut queue: mpsc::Receiver<AsyncTask>,
    selector: Arc<dyn Scheduler>,
    registry: Arc<ProviderRegistry>,
) {
    let tickets = Arc::new(Semaphore::new(TICKETS));

    while let Some(task) = queue.recv().await {
        // take a ticket before spawning so the queue applies backpressure
        let permit = tickets
            .clone()
            .acquire_owned()
            .await
            .expect("ticket semaphore never closes");
        let selector = selector.clone();
        let registry = registry.clone();
        let tickets = tickets.clone();

        tokio::spawn(dispatch_one(task, permit, tickets, selector, registry));
    }
}

/// Drive one task to completion, retrying through the selector on internal
/// failures, then forward the result to the original completion channel.
async fn dispatch_one(
    mut task: AsyncTask,
    permit: tokio::sync::OwnedSemaphorePermit,
    tickets: Arc<Semaphore>,
    selector: Arc<dyn Scheduler>,
    registry: Arc<ProviderRegistry>,
) {
    // intercept the completion channel so we observe the result before the
    // original caller does
    let (intercept_tx, mut intercept_rx) = mpsc::channel(1);
    let original = task.intercept(intercept_tx.clone());

    let token = task.token.clone();
    let request = task.request.clone();
    let task_id = request.task_id();

    let mut ticket = Some(permit);
    let mut current = Some(task);
    let mut outcome: Option<TaskCompletion> = None;

    for round in 0..RETRY_ROUNDS {
        // when retrying, reacquire a ticket and rebuild the task
        if ticket.is_none() {
            ticket = Some(
                tickets
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("ticket semaphore never closes"),
            );
        }
        let attempt = current.take().unwrap_or_else(|| {
            AsyncTask::new(token.clone(), request.clone(), intercept_tx.clone())
        });

        let scheduled = selector.schedule(attempt).await;
        // scheduling is done (or failed); free the ticket while we wait
        drop(ticket.take());

        match scheduled {
            Err(schedule_error) => {
                if matches!(schedule_error.source, Error::Cancelled(_)) {
                    outcome = Some(TaskCompletion {
                        request: request.clone(),
                        response: None,
                        error: Some(schedule_error.source),
                    });
                    break;
                }
                warn!(task = %task_id, round, "selector failed: {}", schedule_error.source);
                outcome = Some(TaskCompletion {
                    request: request.clone(),
                    response: None,
                    error: Some(schedule_error.source),
                });
                current = Some(schedule_error.task);
                tokio::time::sleep(SELECTOR_RETRY_PAUSE).await;
                continue; // retry
            }

            Ok(()) => {
                let completion = match intercept_rx.recv().await {
                    Some(completion) => completion,
                    // the session dropped the task without completing; treat
                    // like a transport failure and retry
                    None => break,
                };

                match &completion.error {
                    // cancellation is terminal, the client went away
                    Some(Error::Cancelled(_)) => {
                        outcome = Some(completion);
                        break;
                    }
                    // transport-level error, or a response with no result:
                    // retry on another provider
                    Some(error) => {
                        debug!(task = %task_id, round, "task attempt failed: {error}");
                        outcome = Some(completion);
                        continue;
                    }
                    None if completion
                        .response
                        .as_ref()
                        .map(|r| r.result.is_none())
                        .unwrap_or(true) =>
                    {
                        debug!(task = %task_id, round, "response without result, retrying");
                        outcome = Some(completion);
                        continue;
                    }
                    // application error or OK result: do not retry, and
                    // advance the throughput counter for the final attempt
                    None => {
                        registry.rate_tick();
                        outcome = Some(completion);
                        break;
                    }
                }
            }
        }
    }

    // still erroneous after all retries, give up with the last outcome
    let completion = outcome.unwrap_or_else(|| TaskCompletion {
        request: request.clone(),
        response: None,
        error: Some(Error::Closing("task dropped without completion".to_string())),
    });
    if original.try_send(completion).is_err() {
        warn!(task = %task_id, "original completion channel rejected result");
    }
}
