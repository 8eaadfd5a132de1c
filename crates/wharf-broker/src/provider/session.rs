//! Per-connection provider session
//!
//! Holds the session state for one connected provider: messenger,
//! resizable concurrency limiter, the set of files known to be on the
//! provider, and the submission gate through which the dispatcher hands
//! over tasks.
//!
//! The submission loop acquires a semaphore permit *before* opening the
//! gate. Holding a permit while parked on the gate is intentional: it
//! prevents oversubscription when a submit is racing in, and it is exactly
//! what makes the rendezvous work — a task can only be claimed by a
//! provider that has a free slot right now.

use crate::error::Error;
use crate::lifetime::Lifetime;
use crate::messenger::{IncomingStreams, Messenger};
use crate::provider::task::AsyncTask;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use wharf_core::ResizableSemaphore;
use wharf_protocol::Event;

/// Identification details of a provider, filled by its hello event.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    /// a unique name for identification
    pub name: String,
    /// remote address of the transport connection
    pub address: String,
    /// software and architecture info
    pub useragent: String,
}

/// One provider connection. Created from a messenger; the submission loop
/// starts immediately, but no tasks flow until the provider announces a
/// non-zero concurrency.
#[derive(Debug)]
pub struct Provider {
    messenger: Arc<Messenger>,
    lifetime: Lifetime,

    /// resizable semaphore limiting concurrent tasks on this provider
    limiter: ResizableSemaphore,

    /// one-slot handoff; the loop only receives while holding a permit
    slot: mpsc::Sender<AsyncTask>,
    /// true while the loop holds a permit and is parked on the slot
    waiting: AtomicBool,
    /// signalled whenever `waiting` flips to true
    ready: Notify,

    info: RwLock<ProviderInfo>,
    files: RwLock<HashSet<String>>,
}

impl Provider {
    /// Set up a provider session on an established messenger and start its
    /// submission loop.
    pub fn new(messenger: Arc<Messenger>) -> Arc<Provider> {
        let address = messenger.remote_addr();
        let (slot_tx, slot_rx) = mpsc::channel(1);

        let provider = Arc::new(Provider {
            messenger,
            lifetime: Lifetime::new(),
            limiter: ResizableSemaphore::new(0),
            slot: slot_tx,
            waiting: AtomicBool::new(false),
            ready: Notify::new(),
            info: RwLock::new(ProviderInfo {
                name: address.clone(),
                address,
                useragent: "unknown".to_string(),
            }),
            files: RwLock::new(HashSet::new()),
        });

        tokio::spawn(provider.clone().accept_tasks(slot_rx));

        // a dead transport takes the whole session down with its cause
        let cascade = provider.clone();
        tokio::spawn(async move {
            cascade.messenger.closing().await;
            let cause = cascade
                .messenger
                .err()
                .unwrap_or_else(|| Error::Closing("messenger closed".to_string()));
            cascade.close(cause).await;
        });

        provider
    }

    pub fn info(&self) -> ProviderInfo {
        self.info.read().clone()
    }

    pub fn addr(&self) -> String {
        self.info.read().address.clone()
    }

    pub(crate) fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub(crate) fn limiter(&self) -> &ResizableSemaphore {
        &self.limiter
    }

    pub(crate) fn lifetime_token(&self) -> &tokio_util::sync::CancellationToken {
        self.lifetime.token()
    }

    // ── closure ──────────────────────────────────────────────────────

    /// The close cause, or `None` while the session is alive.
    pub fn err(&self) -> Option<Error> {
        self.lifetime.err()
    }

    /// Wait for the session to close.
    pub async fn closing(&self) {
        self.lifetime.closing().await
    }

    /// Close the session and the underlying messenger. In-flight RPCs error
    /// out with the cause and complete their tasks terminally.
    pub async fn close(&self, reason: Error) {
        if self.lifetime.is_closed() {
            return;
        }
        self.lifetime.cancel(reason.clone());
        self.messenger.close(reason).await;
    }

    // ── limiter ──────────────────────────────────────────────────────

    /// Tasks currently in flight according to the semaphore.
    pub fn current_tasks(&self) -> usize {
        self.limiter.count()
    }

    /// The configured concurrency limit.
    pub fn current_limit(&self) -> usize {
        self.limiter.limit()
    }

    /// True while the submission loop holds a permit and waits for a task.
    pub fn waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    // ── file set ─────────────────────────────────────────────────────

    /// Whether this provider is known to have a file, without re-probing.
    pub fn has_file(&self, r#ref: &str) -> bool {
        self.files.read().contains(r#ref)
    }

    pub(crate) fn set_files(&self, refs: Vec<String>) {
        *self.files.write() = refs.into_iter().collect();
    }

    pub(crate) fn add_file(&self, r#ref: String) {
        self.files.write().insert(r#ref);
    }

    // ── submission gate ──────────────────────────────────────────────

    /// Try to claim the submission slot. Succeeds only when the loop is
    /// parked with a free permit; the winner must follow up with
    /// [`Provider::deliver`].
    pub(crate) fn try_claim(&self) -> bool {
        !self.lifetime.is_closed()
            && self
                .waiting
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Hand a task to the claimed slot. Returns the task when the session
    /// shut down between claim and delivery.
    pub(crate) fn deliver(&self, task: AsyncTask) -> Result<(), AsyncTask> {
        self.slot.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => task,
            mpsc::error::TrySendError::Closed(task) => task,
        })
    }

    /// A future resolving when the gate (re)opens. Enable it before
    /// sweeping claims so no wakeup is lost.
    pub(crate) fn submit_notified(&self) -> Notified<'_> {
        self.ready.notified()
    }

    /// Accept tasks handed through the gate. One loop per provider; exits
    /// when the lifetime closes and fails any task left in the slot so the
    /// dispatcher can retry it elsewhere.
    async fn accept_tasks(self: Arc<Self>, mut slot_rx: mpsc::Receiver<AsyncTask>) {
        loop {
            // acquire a permit before accepting a task
            if self
                .limiter
                .acquire(1, self.lifetime.token())
                .await
                .is_err()
            {
                break;
            }
            self.waiting.store(true, Ordering::SeqCst);
            self.ready.notify_waiters();

            tokio::select! {
                _ = self.lifetime.closing() => break,

                task = slot_rx.recv() => {
                    let Some(task) = task else { break };
                    // claimant already reset `waiting` when it won the CAS
                    if task.token.is_cancelled() {
                        task.complete(None, Some(Error::Cancelled("cancelled before submission".to_string())));
                        self.limiter.release(1);
                        continue;
                    }
                    // run the request asynchronously; the permit is released
                    // when the RPC settles
                    tokio::spawn(self.clone().run_task(task));
                }
            }
        }

        // fail anything still caught in the slot with the close cause
        slot_rx.close();
        let cause = self
            .err()
            .unwrap_or_else(|| Error::Closing("provider loop ended".to_string()));
        while let Ok(task) = slot_rx.try_recv() {
            task.complete(None, Some(cause.clone()));
        }
        self.close(cause).await;
    }

    /// Execute one task via RPC and complete it. A context cancellation
    /// additionally sends a best-effort cancel event to the provider.
    async fn run_task(self: Arc<Self>, task: AsyncTask) {
        let result = self.execute(&task.token, &task.request).await;

        match result {
            Ok(response) => task.complete(Some(response), None),
            Err(error) => {
                if matches!(error, Error::Cancelled(_)) {
                    let cancel = Event::CancelTask(wharf_protocol::CancelTask {
                        info: task.request.info.clone(),
                        reason: Some(error.to_string()),
                    });
                    if let Err(e) = self.messenger.send_event(&cancel).await {
                        debug!(addr = %self.addr(), "cancel event not delivered: {e}");
                    }
                }
                task.complete(None, Some(error));
            }
        }
        self.limiter.release(1);
    }

    // ── events ───────────────────────────────────────────────────────

    /// Forward an event to the provider.
    pub async fn send_event(&self, event: &Event) -> crate::error::Result<()> {
        self.messenger.send_event(event).await
    }

    /// Handle incoming events and requests from this provider. Run once per
    /// session; returns when the messenger closes.
    pub async fn handle_messages(self: Arc<Self>, streams: IncomingStreams) {
        let IncomingStreams {
            mut events,
            mut requests,
        } = streams;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);
                }
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    // a provider session never serves requests
                    let _ = request
                        .respond(None, Some("requests not supported on provider socket".to_string()))
                        .await;
                }
            }
        }
        self.close(Error::Closing("message streams ended".to_string()))
            .await;
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::ProviderHello(hello) => {
                let mut info = self.info.write();
                if let Some(name) = hello.name.filter(|n| !n.is_empty()) {
                    info.name = name;
                }
                if let Some(useragent) = hello.useragent.filter(|u| !u.is_empty()) {
                    info!(addr = %info.address, useragent = %useragent, "provider hello");
                    info.useragent = useragent;
                }
            }

            Event::ProviderResources(resources) => {
                if let Some(concurrency) = resources.concurrency {
                    info!(addr = %self.addr(), concurrency, "provider resources");
                    self.limiter.set_limit(concurrency as usize);
                }
            }

            Event::FileSystemUpdate(update) => {
                let mut files = self.files.write();
                for file in update.added {
                    files.insert(file);
                }
                // remove after adding, i.e. err on not having the file
                for file in update.removed {
                    files.remove(&file);
                }
            }

            Event::GenericMessage(msg) => {
                info!(addr = %self.addr(), "provider says: {}", msg.message.unwrap_or_default());
            }

            other => {
                warn!(addr = %self.addr(), type_url = other.type_url(), "unknown event from provider");
            }
        }
    }
}
