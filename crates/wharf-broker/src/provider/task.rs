//! The dispatch unit
//!
//! An [`AsyncTask`] travels from the job orchestrator through the dispatcher
//! into a provider's submission gate. Whoever ends up with the task
//! completes it exactly once by sending a [`TaskCompletion`] on its
//! completion channel; ownership moving through the channels makes double
//! completion impossible.

use crate::error::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wharf_protocol::{TaskRequest, TaskResponse};

/// A single parametrized task from an offloading job, ready for submission
/// to a provider.
#[derive(Debug)]
pub struct AsyncTask {
    /// Cancellation scope of the originating request.
    pub token: CancellationToken,
    /// The execution request, metadata included.
    pub request: TaskRequest,
    done: mpsc::Sender<TaskCompletion>,
}

/// The outcome of one task attempt. Either `response` is populated or
/// `error` is set; an error may accompany a partial response.
#[derive(Debug)]
pub struct TaskCompletion {
    /// The request as executed, kept for routing by job id and index.
    pub request: TaskRequest,
    pub response: Option<TaskResponse>,
    /// Broker-internal error (scheduling, transport); application errors
    /// live inside the response.
    pub error: Option<Error>,
}

impl AsyncTask {
    /// Create a task. The completion channel must be buffered, completion
    /// never blocks.
    pub fn new(
        token: CancellationToken,
        request: TaskRequest,
        done: mpsc::Sender<TaskCompletion>,
    ) -> Self {
        debug_assert!(done.max_capacity() > 0, "done channel must be buffered");
        Self {
            token,
            request,
            done,
        }
    }

    /// Replace the completion channel and return the previous one, so an
    /// intermediary can observe completion before the original caller.
    pub fn intercept(
        &mut self,
        done: mpsc::Sender<TaskCompletion>,
    ) -> mpsc::Sender<TaskCompletion> {
        std::mem::replace(&mut self.done, done)
    }

    /// Signal completion. Never blocks; a full or closed channel is a bug in
    /// the channel sizing and is logged instead of awaited.
    pub fn complete(self, response: Option<TaskResponse>, error: Option<Error>) {
        let completion = TaskCompletion {
            request: self.request,
            response,
            error,
        };
        if let Err(e) = self.done.try_send(completion) {
            warn!("task completion channel rejected signal: {e}");
        }
    }
}
