//! Provider selection and the dynamic rendezvous submit
//!
//! A [`Scheduler`] tries to hand a task to some suitable provider, blocking
//! until a submission gate accepts it, the task's context is done, or the
//! policy gives up. Three strategies exist: [`AnyFreeSelector`],
//! [`RoundRobinSelector`] and the default [`SimpleMatchSelector`].
//!
//! The rendezvous itself ([`dynamic_submit`]) is a first-ready-wins choice
//! across the candidates' submission gates: a gate can only be claimed while
//! its session loop holds a free permit, so no provider ever consumes a task
//! it has no capacity for. Submit attempts run under a short internal
//! deadline so that transient emptiness or capacity dearth is retried
//! against a fresh provider snapshot instead of wedging.

mod any_free;
mod round_robin;
mod simple_match;

pub use any_free::AnyFreeSelector;
pub use round_robin::RoundRobinSelector;
pub use simple_match::SimpleMatchSelector;

use crate::error::Error;
use crate::provider::{AsyncTask, Provider, ProviderRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wharf_core::SchedulerKind;

/// Internal deadline for one rendezvous attempt before the candidate
/// snapshot is refreshed.
pub(crate) const SUBMIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// A failed scheduling attempt, handing the task back for retry.
#[derive(Debug)]
pub struct ScheduleError {
    pub task: AsyncTask,
    pub source: Error,
}

/// Strategy interface: submit the task to some provider's gate.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule(&self, task: AsyncTask) -> Result<(), ScheduleError>;
}

/// Construct the configured selector strategy.
pub fn make_scheduler(kind: SchedulerKind, registry: Arc<ProviderRegistry>) -> Arc<dyn Scheduler> {
    match kind {
        SchedulerKind::AnyFree => Arc::new(AnyFreeSelector::new(registry)),
        SchedulerKind::RoundRobin => Arc::new(RoundRobinSelector::new(registry)),
        SchedulerKind::SimpleMatch => Arc::new(SimpleMatchSelector::new(registry)),
    }
}

/// Offer a task to all candidates at once; whichever submission gate becomes
/// claimable first wins it. Resolution order when nothing is ready:
/// cancellation of `token`, then the optional deadline.
///
/// With zero candidates this waits for the token or deadline — callers MUST
/// bound the wait, or the offer blocks as long as the token lives.
pub(crate) async fn dynamic_submit(
    token: &CancellationToken,
    mut task: AsyncTask,
    candidates: &[Arc<Provider>],
    deadline: Option<tokio::time::Instant>,
) -> Result<(), (AsyncTask, Error)> {
    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    // with no candidates there is nothing to offer to; only the token or
    // the deadline can resolve this
    if candidates.is_empty() {
        tokio::select! {
            _ = token.cancelled() => {
                return Err((task, Error::Cancelled("submit cancelled".to_string())));
            }
            _ = &mut expired => {
                return Err((task, Error::SubmitTimeout));
            }
        }
    }

    loop {
        // register interest in every gate before sweeping, so a gate that
        // opens mid-sweep wakes us instead of being lost
        let mut notified: Vec<_> = candidates
            .iter()
            .map(|p| Box::pin(p.submit_notified()))
            .collect();
        for n in notified.iter_mut() {
            n.as_mut().enable();
        }

        for provider in candidates {
            if provider.try_claim() {
                match provider.deliver(task) {
                    Ok(()) => return Ok(()),
                    // session shut down between claim and delivery, offer on
                    Err(returned) => task = returned,
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                return Err((task, Error::Cancelled("submit cancelled".to_string())));
            }
            _ = &mut expired => {
                return Err((task, Error::SubmitTimeout));
            }
            _ = futures::future::select_all(notified) => {
                // some gate opened, sweep again
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::Messenger;
    use crate::provider::TaskCompletion;
    use crate::transport::MemoryTransport;
    use tokio::sync::mpsc;
    use wharf_protocol::TaskRequest;

    pub(crate) fn gated_provider() -> (Arc<Provider>, Arc<Messenger>) {
        named_gated_provider("provider")
    }

    pub(crate) fn named_gated_provider(name: &str) -> (Arc<Provider>, Arc<Messenger>) {
        let (near, far) = MemoryTransport::pair("broker", name);
        let (messenger, _streams) = Messenger::new(Arc::new(near));
        let (peer, peer_streams) = Messenger::new(Arc::new(far));
        // peer never answers; keep its streams from closing the session
        tokio::spawn(async move {
            let mut streams = peer_streams;
            while streams.requests.recv().await.is_some() {}
        });
        (Provider::new(messenger), peer)
    }

    fn test_task() -> (AsyncTask, mpsc::Receiver<TaskCompletion>) {
        let (tx, rx) = mpsc::channel(1);
        (
            AsyncTask::new(CancellationToken::new(), TaskRequest::default(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_zero_candidates_resolves_on_cancellation() {
        let (task, _rx) = test_task();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let (_, err) = dynamic_submit(&token, task, &[], None).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_zero_candidates_resolves_on_deadline() {
        let (task, _rx) = test_task();
        let token = CancellationToken::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(20);

        let (_, err) = dynamic_submit(&token, task, &[], Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubmitTimeout));
    }

    #[tokio::test]
    async fn test_submit_to_waiting_provider() {
        let (provider, _peer) = gated_provider();
        provider.limiter().set_limit(1);
        // let the session loop park on its gate
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(provider.waiting());

        let (task, _rx) = test_task();
        let token = CancellationToken::new();
        dynamic_submit(&token, task, &[provider.clone()], None)
            .await
            .unwrap();

        // the loop picked the task up and started the RPC
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(provider.current_tasks(), 1);
        assert!(!provider.waiting());
    }

    #[tokio::test]
    async fn test_submit_times_out_on_busy_provider() {
        let (provider, _peer) = gated_provider();
        // limit stays 0: the gate never opens
        let (task, _rx) = test_task();
        let token = CancellationToken::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(50);

        let (_, err) = dynamic_submit(&token, task, &[provider], Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubmitTimeout));
    }

    #[tokio::test]
    async fn test_gate_opening_wakes_parked_submit() {
        let (provider, _peer) = gated_provider();
        let (task, _rx) = test_task();
        let token = CancellationToken::new();

        let open = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            open.limiter().set_limit(1);
        });

        // no deadline: resolves only because the gate opens
        dynamic_submit(&token, task, &[provider], None).await.unwrap();
    }
}
