//! End-to-end broker scenarios over in-memory transports
//!
//! A scripted peer plays the provider role on the far side of a memory
//! transport pair: it answers file listings, probes, uploads and task
//! requests the way the browser provider would, while the near side runs
//! the real session, registry, scheduler and dispatcher stack.

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wharf_broker::dispatcher;
use wharf_broker::jobs::{self, OffloadingJob};
use wharf_broker::messenger::{IncomingStreams, Messenger};
use wharf_broker::provider::{Provider, ProviderRegistry};
use wharf_broker::scheduler::{self, Scheduler};
use wharf_broker::transport::MemoryTransport;
use wharf_core::{FileStorage, SchedulerKind};
use wharf_protocol::{
    pack_any, Event, File, FileListingRequest, FileListingResponse, FileProbeResponse,
    FileUploadResponse, OffloadJobRequest, OffloadJobResponse, Payload, ProviderResources,
    TaskOutput, TaskParams, TaskRequest, TaskResponse, TaskResult, Wasip1Params,
};

/// How the scripted peer reacts to task requests.
#[derive(Clone, Copy, PartialEq)]
enum Behavior {
    /// sleep for the delay, then answer OK
    Run,
    /// drop the connection instead of answering the first task
    DieOnFirstTask,
}

/// Counters exposed by a scripted provider peer.
#[derive(Clone, Default)]
struct PeerStats {
    current: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
    executed: Arc<AtomicUsize>,
    cancels_seen: Arc<AtomicUsize>,
}

/// Spawn a provider session whose far side is scripted. Returns the broker
/// side session (already file-listed) and the peer's counters.
async fn scripted_provider(
    addr: &str,
    files: Vec<String>,
    concurrency: u32,
    delay: Duration,
    behavior: Behavior,
) -> (Arc<Provider>, PeerStats) {
    let (near, far) = MemoryTransport::pair("broker", addr);
    let (messenger, streams) = Messenger::new(Arc::new(near));
    let (peer, peer_streams) = Messenger::new(Arc::new(far));
    let IncomingStreams {
        events: mut peer_events,
        requests: mut peer_requests,
    } = peer_streams;

    let stats = PeerStats::default();
    let peer_stats = stats.clone();
    let peer_for_events = peer.clone();

    // count best-effort cancel events
    tokio::spawn(async move {
        while let Some(event) = peer_events.recv().await {
            if matches!(event, Event::CancelTask(_)) {
                peer_stats.cancels_seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    // answer requests like a browser provider would
    let request_stats = stats.clone();
    tokio::spawn(async move {
        let died = Arc::new(AtomicUsize::new(0));
        while let Some(request) = peer_requests.recv().await {
            match request.payload.type_url.as_str() {
                FileListingRequest::TYPE_URL => {
                    let response = FileListingResponse {
                        files: files.clone(),
                    };
                    let _ = request.respond(Some(pack_any(&response)), None).await;
                }
                wharf_protocol::FileProbeRequest::TYPE_URL => {
                    let response = FileProbeResponse { ok: Some(false) };
                    let _ = request.respond(Some(pack_any(&response)), None).await;
                }
                wharf_protocol::FileUploadRequest::TYPE_URL => {
                    let _ = request
                        .respond(Some(pack_any(&FileUploadResponse::default())), None)
                        .await;
                }
                TaskRequest::TYPE_URL => {
                    if behavior == Behavior::DieOnFirstTask
                        && died.fetch_add(1, Ordering::SeqCst) == 0
                    {
                        peer.close(wharf_broker::Error::Connection("unplugged".into()))
                            .await;
                        continue;
                    }
                    let stats = request_stats.clone();
                    tokio::spawn(async move {
                        let now = stats.current.fetch_add(1, Ordering::SeqCst) + 1;
                        stats.max_concurrent.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;

                        let task: TaskRequest = request.unpack().unwrap();
                        let args = match &task.params {
                            Some(TaskParams::Wasip1(p)) => p.args.join(" "),
                            _ => String::new(),
                        };
                        let response = TaskResponse {
                            info: task.info.clone(),
                            result: Some(TaskResult::Ok(TaskOutput {
                                status: Some(0),
                                stdout: Some(Bytes::from(args)),
                                ..Default::default()
                            })),
                        };
                        let _ = request.respond(Some(pack_any(&response)), None).await;
                        stats.current.fetch_sub(1, Ordering::SeqCst);
                        stats.executed.fetch_add(1, Ordering::SeqCst);
                    });
                }
                other => {
                    let other = other.to_string();
                    let _ = request
                        .respond(None, Some(format!("unexpected request: {other}")))
                        .await;
                }
            }
        }
    });

    // session on the broker side, like the provider socket handler does it
    let provider = Provider::new(messenger);
    tokio::spawn(provider.clone().handle_messages(streams));
    provider.list_files().await.unwrap();

    // announce the worker pool size
    peer_for_events
        .send_event(&Event::ProviderResources(ProviderResources {
            concurrency: Some(concurrency),
            tasks: None,
        }))
        .await
        .unwrap();
    // wait for the limit to take effect
    let deadline = Instant::now() + Duration::from_secs(1);
    while provider.current_limit() != concurrency as usize {
        assert!(Instant::now() < deadline, "resource event never applied");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    (provider, stats)
}

/// A broker stack: storage, registry, simple-match scheduler, dispatcher.
struct Broker {
    registry: Arc<ProviderRegistry>,
    queue: mpsc::Sender<wharf_broker::provider::AsyncTask>,
}

fn broker_stack() -> Broker {
    let registry = ProviderRegistry::new(FileStorage::in_memory());
    let selector: Arc<dyn Scheduler> =
        scheduler::make_scheduler(SchedulerKind::SimpleMatch, registry.clone());
    let (queue_tx, queue_rx) = mpsc::channel(10);
    tokio::spawn(dispatcher::run(queue_rx, selector, registry.clone()));
    Broker {
        registry,
        queue: queue_tx,
    }
}

/// Register a provider and mirror the socket handler's cleanup-on-close.
fn register(broker: &Broker, provider: Arc<Provider>) {
    broker.registry.add(provider.clone());
    let registry = broker.registry.clone();
    tokio::spawn(async move {
        provider.closing().await;
        registry.remove(&provider.addr());
    });
}

fn job_requiring(r#ref: &str, tasks: usize) -> OffloadJobRequest {
    OffloadJobRequest {
        parent: Some(Wasip1Params {
            binary: Some(File {
                r#ref: Some(r#ref.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        tasks: (0..tasks)
            .map(|i| Wasip1Params {
                args: vec![format!("task-{i}")],
                ..Default::default()
            })
            .collect(),
    }
}

async fn run_job(broker: &Broker, token: &CancellationToken, spec: OffloadJobRequest) -> OffloadJobResponse {
    let job = OffloadingJob::new("client:1", spec);
    jobs::dispatch_job(&broker.registry, &broker.queue, token, job).await
}

#[tokio::test]
async fn happy_path_runs_three_tasks_on_two_permits() {
    let broker = broker_stack();
    let file = broker
        .registry
        .storage
        .insert(Some("app.wasm"), "application/wasm", Bytes::from_static(b"\0asm"))
        .unwrap();
    let r#ref = file.file_ref().to_string();

    let delay = Duration::from_millis(150);
    let (provider, stats) =
        scripted_provider("p1:1", vec![r#ref.clone()], 2, delay, Behavior::Run).await;
    register(&broker, provider);

    let started = Instant::now();
    let response = run_job(&broker, &CancellationToken::new(), job_requiring(&r#ref, 3)).await;
    let elapsed = started.elapsed();

    assert!(response.failure.is_none());
    assert_eq!(response.tasks.len(), 3);
    for (i, task) in response.tasks.iter().enumerate() {
        match &task.result {
            Some(TaskResult::Ok(output)) => {
                // results come back in original task order
                assert_eq!(output.stdout.as_ref().unwrap(), &format!("task-{i}"));
            }
            other => panic!("task {i} not ok: {other:?}"),
        }
    }

    // two tasks ran concurrently, the third waited for a permit
    assert_eq!(stats.max_concurrent.load(Ordering::SeqCst), 2);
    assert_eq!(stats.executed.load(Ordering::SeqCst), 3);
    assert!(elapsed >= 2 * delay, "two rounds of work take at least 2x delay");
}

#[tokio::test]
async fn unknown_ref_fails_job_before_dispatch() {
    let broker = broker_stack();
    let (provider, stats) =
        scripted_provider("p1:1", vec![], 2, Duration::from_millis(10), Behavior::Run).await;
    register(&broker, provider);

    let response = run_job(
        &broker,
        &CancellationToken::new(),
        job_requiring("sha256:unknown-xyz", 3),
    )
    .await;

    assert!(response.failure.unwrap().contains("sha256:unknown-xyz"));
    assert!(response.tasks.is_empty());
    assert_eq!(stats.executed.load(Ordering::SeqCst), 0, "nothing dispatched");
}

#[tokio::test]
async fn disconnect_mid_task_retries_on_another_provider() {
    let broker = broker_stack();
    let file = broker
        .registry
        .storage
        .insert(None, "application/wasm", Bytes::from_static(b"\0asm"))
        .unwrap();
    let r#ref = file.file_ref().to_string();

    let (dying, dying_stats) = scripted_provider(
        "dying:1",
        vec![r#ref.clone()],
        4,
        Duration::from_millis(10),
        Behavior::DieOnFirstTask,
    )
    .await;
    register(&broker, dying);

    let response = {
        // the healthy provider joins while the first task is in flight
        let broker_ref = &broker;
        let healthy_ref = r#ref.clone();
        let join_healthy = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (healthy, stats) = scripted_provider(
                "healthy:2",
                vec![healthy_ref],
                4,
                Duration::from_millis(10),
                Behavior::Run,
            )
            .await;
            register(broker_ref, healthy);
            stats
        };
        let token = CancellationToken::new();
        let run = run_job(broker_ref, &token, job_requiring(&r#ref, 1));
        let (healthy_stats, response) = tokio::join!(join_healthy, run);

        assert_eq!(healthy_stats.executed.load(Ordering::SeqCst), 1);
        response
    };

    assert!(response.failure.is_none());
    assert!(response.tasks[0].is_ok(), "retry must succeed: {:?}", response.tasks[0]);
    assert_eq!(dying_stats.executed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrency_clamp_of_one_serializes_tasks() {
    let broker = broker_stack();
    let file = broker
        .registry
        .storage
        .insert(None, "application/wasm", Bytes::from_static(b"\0asm"))
        .unwrap();
    let r#ref = file.file_ref().to_string();

    let (provider, stats) = scripted_provider(
        "serial:1",
        vec![r#ref.clone()],
        1,
        Duration::from_millis(30),
        Behavior::Run,
    )
    .await;
    register(&broker, provider);

    let response = run_job(&broker, &CancellationToken::new(), job_requiring(&r#ref, 5)).await;

    assert!(response.failure.is_none());
    assert!(response.tasks.iter().all(|t| t.is_ok()));
    assert_eq!(stats.executed.load(Ordering::SeqCst), 5);
    assert_eq!(
        stats.max_concurrent.load(Ordering::SeqCst),
        1,
        "tasks must execute strictly serially"
    );
}

#[tokio::test]
async fn cancellation_aborts_remaining_tasks() {
    let broker = broker_stack();
    let file = broker
        .registry
        .storage
        .insert(None, "application/wasm", Bytes::from_static(b"\0asm"))
        .unwrap();
    let r#ref = file.file_ref().to_string();

    // slow provider: every task takes 200ms, one at a time
    let (provider, stats) = scripted_provider(
        "slow:1",
        vec![r#ref.clone()],
        1,
        Duration::from_millis(200),
        Behavior::Run,
    )
    .await;
    register(&broker, provider);

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let response = run_job(&broker, &token, job_requiring(&r#ref, 10)).await;

    assert!(token.is_cancelled());
    assert_eq!(response.tasks.len(), 10);
    let ok = response.tasks.iter().filter(|t| t.is_ok()).count();
    let cancelled = response
        .tasks
        .iter()
        .filter(|t| {
            t.error_message()
                .map(|e| e.contains("cancel"))
                .unwrap_or(false)
        })
        .count();
    assert!(ok >= 1, "at least the first task finishes");
    assert!(cancelled >= 1, "later tasks observe the cancellation");
    assert_eq!(ok + cancelled, 10, "every task settles one way or the other");
    assert!(
        stats.executed.load(Ordering::SeqCst) < 10,
        "cancellation must stop the job early"
    );
}
