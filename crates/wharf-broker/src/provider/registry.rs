//! Registry of live provider sessions
//!
//! A concurrent map keyed by remote address, plus the cluster-level event
//! broadcast and the rolling task-completion counter. Two background tasks
//! run per registry: one forwards broadcast events to every provider, one
//! computes throughput every second, updates the exported gauges and
//! broadcasts the figure.

use crate::provider::session::Provider;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use wharf_core::{metrics, FileStorage, RateCounter};
use wharf_protocol::{ClusterInfo, Event, Throughput};

/// Broadcast channel depth; events beyond this are dropped, never blocked on.
const BROADCAST_CAPACITY: usize = 10;

/// The rolling window for the throughput figure.
const RATE_WINDOW: Duration = Duration::from_secs(5);

pub struct ProviderRegistry {
    providers: DashMap<String, Arc<Provider>>,

    /// uploaded files, also used for request-time resolution
    pub storage: FileStorage,

    broadcast: mpsc::Sender<Event>,
    rate: RateCounter,
}

impl ProviderRegistry {
    /// Create the registry and start its broadcast and throughput loops.
    pub fn new(storage: FileStorage) -> Arc<Self> {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_CAPACITY);
        let registry = Arc::new(ProviderRegistry {
            providers: DashMap::new(),
            storage,
            broadcast: broadcast_tx,
            rate: RateCounter::new(RATE_WINDOW, 5),
        });

        tokio::spawn(registry.clone().transmitter(broadcast_rx));
        tokio::spawn(registry.clone().throughput(Duration::from_secs(1)));
        registry
    }

    // ── membership ───────────────────────────────────────────────────

    /// Add a provider and broadcast the new cluster size.
    pub fn add(&self, provider: Arc<Provider>) {
        self.providers.insert(provider.addr(), provider);
        info!(connected = self.size(), "provider registry");
        self.broadcast_event(Event::ClusterInfo(ClusterInfo {
            providers: Some(self.size() as u32),
        }));
    }

    /// Remove a provider by address and broadcast the new cluster size.
    pub fn remove(&self, addr: &str) {
        self.providers.remove(addr);
        info!(connected = self.size(), "provider registry");
        self.broadcast_event(Event::ClusterInfo(ClusterInfo {
            providers: Some(self.size() as u32),
        }));
    }

    pub fn size(&self) -> usize {
        self.providers.len()
    }

    pub fn load(&self, addr: &str) -> Option<Arc<Provider>> {
        self.providers.get(addr).map(|p| p.value().clone())
    }

    /// Snapshot of the current provider addresses.
    pub fn keys(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of the current provider sessions.
    pub fn values(&self) -> Vec<Arc<Provider>> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }

    // ── throughput ───────────────────────────────────────────────────

    /// Advance the completion counter; call once per successful task.
    pub fn rate_tick(&self) {
        self.rate.incr(1);
    }

    /// Queue an event for all providers; never blocks.
    pub fn broadcast_event(&self, event: Event) {
        let _ = self.broadcast.try_send(event);
    }

    /// Forward broadcast events to every connected provider.
    async fn transmitter(self: Arc<Self>, mut broadcast_rx: mpsc::Receiver<Event>) {
        while let Some(event) = broadcast_rx.recv().await {
            for provider in self.values() {
                let _ = provider.send_event(&event).await;
            }
        }
    }

    /// Periodically compute tasks/sec, update the gauges and broadcast.
    async fn throughput(self: Arc<Self>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let tps = self.rate.rate();
            metrics::set_throughput(tps);
            metrics::set_providers_connected(self.size());
            metrics::set_workers_total(self.values().iter().map(|p| p.current_limit()).sum());
            self.broadcast_event(Event::Throughput(Throughput {
                overall: Some(tps as f32),
            }));
        }
    }
}
