//! Offloading jobs: fan-out, await, aggregate
//!
//! A job is a batch of task specifications sharing optional parent defaults.
//! The orchestrator resolves every referenced file against the store (the
//! whole job fails if any reference is broken), expands the specs into
//! [`AsyncTask`]s on the shared dispatcher queue, waits for all completions
//! and assembles the ordered job response.

use crate::provider::{AsyncTask, ProviderRegistry, TaskCompletion};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wharf_protocol::{
    OffloadJobRequest, OffloadJobResponse, TaskMetadata, TaskParams, TaskRequest, TaskResponse,
    TaskResult,
};

/// Process-wide job id counter; ids are zero-padded for sortable logs.
static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Allocate the next job id.
pub fn next_job_id() -> String {
    format!("{:05}", JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1)
}

/// A client-submitted job with broker-side bookkeeping.
pub struct OffloadingJob {
    /// tracks all tasks of this request
    pub job_id: String,
    /// remote address of the requesting client
    pub client_addr: String,
    pub spec: OffloadJobRequest,
}

impl OffloadingJob {
    pub fn new(client_addr: impl Into<String>, spec: OffloadJobRequest) -> Self {
        Self {
            job_id: next_job_id(),
            client_addr: client_addr.into(),
            spec,
        }
    }
}

/// Run a job to completion: resolve, enqueue, await, aggregate. The token
/// spans the client request; cancelling it aborts in-flight tasks.
pub async fn dispatch_job(
    registry: &ProviderRegistry,
    queue: &mpsc::Sender<AsyncTask>,
    token: &CancellationToken,
    mut job: OffloadingJob,
) -> OffloadJobResponse {
    info!(
        job = %job.job_id,
        client = %job.client_addr,
        tasks = job.spec.tasks.len(),
        "offloading job"
    );

    // resolve all file references up front; any failure fails the whole job
    // before a single task is dispatched
    let mut errs = Vec::new();
    if let Some(parent) = job.spec.parent.as_mut() {
        if let Err(e) = registry.storage.resolve_params(parent) {
            errs.push(e);
        }
    }
    for task in job.spec.tasks.iter_mut() {
        if let Err(e) = registry.storage.resolve_params(task) {
            errs.push(e);
        }
    }
    if !errs.is_empty() {
        let failure = errs
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return OffloadJobResponse {
            failure: Some(failure),
            tasks: vec![],
        };
    }

    if job.spec.tasks.is_empty() {
        return OffloadJobResponse {
            failure: Some("no tasks specified".to_string()),
            tasks: vec![],
        };
    }

    // fan out into the dispatcher queue, all tasks sharing one done channel
    let count = job.spec.tasks.len();
    let (done_tx, mut done_rx) = mpsc::channel::<TaskCompletion>(count + 10);

    for (index, spec) in job.spec.tasks.iter().enumerate() {
        let params = match &job.spec.parent {
            Some(parent) => spec.clone().inherit(parent),
            None => spec.clone(),
        };
        let request = TaskRequest {
            info: Some(TaskMetadata {
                job_id: Some(job.job_id.clone()),
                index: Some(index as u64),
                client: Some(job.client_addr.clone()),
            }),
            params: Some(TaskParams::Wasip1(params)),
        };
        let task = AsyncTask::new(token.clone(), request, done_tx.clone());
        if queue.send(task).await.is_err() {
            return OffloadJobResponse {
                failure: Some("dispatcher queue closed".to_string()),
                tasks: vec![],
            };
        }
    }

    // await all completions and slot them back into request order
    let mut responses: Vec<TaskResponse> = (0..count).map(|_| TaskResponse::default()).collect();
    let mut done = 0;
    while done < count {
        let Some(completion) = done_rx.recv().await else {
            break;
        };
        done += 1;
        let index = completion
            .request
            .info
            .as_ref()
            .and_then(|i| i.index)
            .unwrap_or(0) as usize;
        responses[index.min(count - 1)] = into_task_response(completion);
    }

    OffloadJobResponse {
        failure: None,
        tasks: responses,
    }
}

/// Map a completion into the client-facing per-task response. Internal
/// errors become per-task error strings unless the provider already
/// reported an application error.
fn into_task_response(completion: TaskCompletion) -> TaskResponse {
    let mut response = completion.response.unwrap_or_default();
    if response.info.is_none() {
        response.info = completion.request.info.clone();
    }
    if let Some(error) = completion.error {
        if !matches!(response.result, Some(TaskResult::Error(_))) {
            response.result = Some(TaskResult::Error(error.to_string()));
        }
    }
    response
}
