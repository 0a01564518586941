//! Background worker that turns save requests into snapshot writes.
//!
//! Explicit requests are debounced per tenant: the first write happens
//! straight away, later requests inside the window collapse into a single
//! trailing write. A periodic sweep writes every dirty tenant and any that
//! has not been saved recently. Cancellation flushes every dirty tenant,
//! including ones whose save request never made it into the queue.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::StateStore;

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub queue_capacity: usize,
    pub debounce: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            debounce: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Per-tenant bookkeeping for when to write next.
#[derive(Debug)]
pub(crate) struct SaveTracker {
    debounce: Duration,
    stale_after: Duration,
    last_saved: HashMap<String, Instant>,
    /// Tenant -> when its deferred write is due.
    pending: HashMap<String, Instant>,
}

impl SaveTracker {
    pub(crate) fn new(debounce: Duration, stale_after: Duration) -> Self {
        Self {
            debounce,
            stale_after,
            last_saved: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Returns true if the tenant should be written now. Otherwise a trailing
    /// write is scheduled for the end of the debounce window.
    pub(crate) fn request(&mut self, tenant: &str, now: Instant) -> bool {
        match self.last_saved.get(tenant) {
            Some(last) if now.saturating_duration_since(*last) < self.debounce => {
                let due = *last + self.debounce;
                self.pending.entry(tenant.to_string()).or_insert(due);
                false
            }
            _ => !self.pending.contains_key(tenant),
        }
    }

    pub(crate) fn saved(&mut self, tenant: &str, now: Instant) {
        self.last_saved.insert(tenant.to_string(), now);
        self.pending.remove(tenant);
    }

    /// Try again after another debounce window.
    pub(crate) fn failed(&mut self, tenant: &str, now: Instant) {
        self.pending.insert(tenant.to_string(), now + self.debounce);
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(tenant, _)| tenant.clone())
            .collect();
        for tenant in &due {
            self.pending.remove(tenant);
        }
        due
    }

    /// Tenants among `known` that were never saved, or not for a while.
    pub(crate) fn stale(&self, known: &[String], now: Instant) -> Vec<String> {
        known
            .iter()
            .filter(|tenant| match self.last_saved.get(tenant.as_str()) {
                Some(last) => now.saturating_duration_since(*last) >= self.stale_after,
                None => true,
            })
            .cloned()
            .collect()
    }

    pub(crate) fn take_pending(&mut self) -> Vec<String> {
        self.pending.drain().map(|(tenant, _)| tenant).collect()
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn write(store: &StateStore, tracker: &mut SaveTracker, tenant: &str) {
    if store.persist(tenant).await {
        tracker.saved(tenant, Instant::now());
    } else {
        tracker.failed(tenant, Instant::now());
    }
}

pub(crate) async fn run(
    store: Arc<StateStore>,
    mut requests: mpsc::Receiver<String>,
    config: PersistenceConfig,
    cancel: CancellationToken,
) {
    let mut tracker = SaveTracker::new(config.debounce, config.stale_after);
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; nothing is stale at startup.
    sweep.tick().await;

    info!(
        "Persistence worker started (debounce {:?}, sweep every {:?})",
        config.debounce, config.sweep_interval
    );

    loop {
        let next_due = tracker.next_due();
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => {
                let Some(tenant) = request else { break };
                if tracker.request(&tenant, Instant::now()) {
                    write(&store, &mut tracker, &tenant).await;
                } else {
                    debug!("Deferring save of tenant {}", tenant);
                }
            }
            _ = sleep_until(next_due) => {
                for tenant in tracker.take_due(Instant::now()) {
                    write(&store, &mut tracker, &tenant).await;
                }
            }
            _ = sweep.tick() => {
                let known = store.tenants().await;
                let mut due: BTreeSet<String> = store.dirty_tenants().await.into_iter().collect();
                due.extend(tracker.stale(&known, Instant::now()));
                for tenant in due {
                    debug!("Sweeping tenant {}", tenant);
                    write(&store, &mut tracker, &tenant).await;
                }
            }
        }
    }

    // Final flush: everything deferred, still queued or otherwise dirty.
    let mut remaining: BTreeSet<String> = tracker.take_pending().into_iter().collect();
    requests.close();
    while let Ok(tenant) = requests.try_recv() {
        remaining.insert(tenant);
    }
    remaining.extend(store.dirty_tenants().await);
    info!("Persistence worker stopping, flushing {} tenant(s)", remaining.len());
    for tenant in remaining {
        write(&store, &mut tracker, &tenant).await;
    }
}
